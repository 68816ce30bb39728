//! Benchmarks the end-to-end evolution loop on a small branching module.

use criterion::{criterion_group, criterion_main, Criterion};

use forjar::config::{Algorithm, AssertionStrategy, Configuration, StoppingConfig};
use forjar::generator::{generate, CONSENT_ENV};
use forjar::lang::Project;

const TARGET: &str = r#"
def grade(score: int) -> str {
    if score >= 90 { return "A" }
    if score >= 80 { return "B" }
    if score >= 70 { return "C" }
    return "F"
}
"#;

fn bench_generation(c: &mut Criterion) {
    std::env::set_var(CONSENT_ENV, "1");
    let project = Project::new().with_module("grades", TARGET);
    let mut config = Configuration::default();
    config.algorithm = Algorithm::DynaMosa;
    config.seed = Some(1);
    config.population_size = 20;
    config.max_test_length = 6;
    config.stopping = vec![
        StoppingConfig::MaxIterations(10),
        StoppingConfig::MaxCoverage(1.0),
    ];
    config.assertion_strategy = AssertionStrategy::None;

    c.bench_function("dynamosa_grades", |b| {
        b.iter(|| generate(&project, "grades", &config).expect("generation"));
    });
}

criterion_group!(benches, bench_generation);
criterion_main!(benches);
