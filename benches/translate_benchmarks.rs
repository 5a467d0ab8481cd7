//! Benchmarks for the expression-to-SQL pipeline.
//!
//! Benchmarks cover:
//! - Expression parsing (text → AST), uncached
//! - Translation (AST → statement AST)
//! - Full compile (parse → translate → render), through the parse cache
//! - Publication filter compilation with shorthand expansion
//!
//! Run with: `cargo bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use jsonata_sql::expr::parse_uncached;
use jsonata_sql::translate::{Context, Params, Translator};
use jsonata_sql::{compile_filter, normalize_schema, parse, Compiler, RawSchema, Schema};

// ---------------------------------------------------------------------------
// Expression inputs organized by complexity
// ---------------------------------------------------------------------------

const TABLE_SCAN: &str = "$$pubs";

const SIMPLE_FILTER: &str = "$$pubs[score > 3 and title != null]";

const RELATION_FILTER: &str = "$$pubs[stage.name = 'Review' and $contains(title, 'draft')]";

const SORTED_WINDOW: &str = "$$pubs[score >= 1]^(>createdAt, title)[[10..19]]";

const OBJECT_PROJECTION: &str =
    "$$pubs[score > 3].{ \"id\": id, \"title\": $uppercase(title), \"stage\": stage.name }";

const AGGREGATE: &str = "$count($$pubs[stage.order > 2])";

const NESTED_SUBQUERY: &str =
    "$$stages.{ \"name\": name, \"pubs\": $count(pubs), \"titles\": pubs.title }";

const ATTRIBUTE_FILTER: &str =
    "$$pubs[attrs.title = 'Hello' and $exists(attrs.description)]^(<createdAt)[0]";

const SCHEMA: &str = r#"
[tables.pubs.fields]
id = {}
title = {}
createdAt = { type = "timestamp" }
stageId = {}
score = { type = "number" }

[tables.pubs.relations]
stage = { foreignKey = "stageId", targetTable = "stages", targetKey = "id" }
attrs = { foreignKey = "id", targetTable = "pub_values", targetKey = "pubId" }

[tables.stages.fields]
id = {}
name = {}
order = { type = "number" }

[tables.stages.relations]
pubs = { foreignKey = "id", targetTable = "pubs", targetKey = "stageId" }

[tables.pub_values.fields]
id = {}
pubId = {}
fieldId = {}
value = { type = "json" }

[tables.pub_values.relations]
attrDef = { foreignKey = "fieldId", targetTable = "pub_fields", targetKey = "id" }

[tables.pub_fields.fields]
id = {}
slug = {}
"#;

fn schema() -> Schema {
    let raw: RawSchema = toml::from_str(SCHEMA).unwrap();
    normalize_schema(raw).unwrap()
}

const CASES: [(&str, &str); 7] = [
    ("table_scan", TABLE_SCAN),
    ("simple_filter", SIMPLE_FILTER),
    ("relation_filter", RELATION_FILTER),
    ("sorted_window", SORTED_WINDOW),
    ("object_projection", OBJECT_PROJECTION),
    ("aggregate", AGGREGATE),
    ("nested_subquery", NESTED_SUBQUERY),
];

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("parsing");

    for (name, expr) in &CASES {
        group.bench_with_input(BenchmarkId::new("parse", name), expr, |b, expr| {
            b.iter(|| parse_uncached(black_box(expr)).unwrap());
        });
    }

    group.finish();
}

fn bench_translation(c: &mut Criterion) {
    let mut group = c.benchmark_group("translation");

    let schema = schema();
    let params = Params::new();

    for (name, expr) in &CASES {
        let ast = parse_uncached(expr).unwrap();
        group.bench_with_input(BenchmarkId::new("translate", name), &ast, |b, ast| {
            b.iter(|| {
                let mut translator = Translator::new(&schema, &params);
                translator
                    .translate(black_box(ast), &Context::root())
                    .unwrap()
            });
        });
    }

    group.finish();
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");

    let compiler = Compiler::new(schema());
    let params = Params::new();

    for (name, expr) in &CASES {
        // Warm the parse cache so the loop measures translation and rendering.
        parse(expr).unwrap();
        group.bench_with_input(BenchmarkId::new("compile", name), expr, |b, expr| {
            b.iter(|| compiler.compile(black_box(expr), &params).unwrap());
        });
    }

    group.finish();
}

fn bench_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter");

    let schema = schema();

    group.bench_function("attribute_filter", |b| {
        b.iter(|| compile_filter(black_box(ATTRIBUTE_FILTER), &schema, "ns").unwrap());
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_parsing,
    bench_translation,
    bench_compile,
    bench_filter,
);
criterion_main!(benches);
