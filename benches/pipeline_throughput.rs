//! Throughput of item-stage chains, fan-out groups and batch windows.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rustpipe::config::EngineConfig;
use rustpipe::pipeline::{BatchStage, Element, ItemStage, PipelineComposer, StageRegistry};
use rustpipe::{Message, Payload};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Runtime;

const ITEMS: u64 = 10_000;

fn composer() -> PipelineComposer {
    let registry = StageRegistry::new()
        .with(ItemStage::from_fn("tag", |mut p: Payload| {
            p["tagged"] = json!(true);
            Ok(Some(p))
        }))
        .and_then(|r| r.with(ItemStage::from_fn("pass", |p| Ok(Some(p)))))
        .and_then(|r| {
            r.with(BatchStage::from_fn("count", |mut elements: Vec<Element>| {
                let n = elements.len();
                for e in elements.iter_mut() {
                    e.succeed(json!({ "window": n }));
                }
                Ok(elements)
            }))
        })
        .unwrap();

    PipelineComposer::new(Arc::new(registry), EngineConfig::default())
}

fn records() -> Vec<Message> {
    (0..ITEMS)
        .map(|i| Message::new(json!({ "id": i, "name": format!("record-{}", i) })))
        .collect()
}

fn bench_definitions(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");
    group.throughput(Throughput::Elements(ITEMS));
    group.sample_size(20);

    let composer = composer();
    let definitions = [
        ("item_chain", "tag|pass|tag"),
        ("fanout", "tag+pass"),
        ("batch_10", "tag|count(size=10,time=1s)"),
        ("batch_500", "tag|count(size=500,time=1s)"),
    ];

    for (label, definition) in definitions {
        let pipeline = composer.compose(definition).unwrap();
        group.bench_with_input(BenchmarkId::new("run", label), &pipeline, |b, pipeline| {
            b.to_async(Runtime::new().unwrap()).iter(|| async {
                let source = futures::stream::iter(records());
                let (results, _, _) = pipeline.run(source).collect().await.unwrap();
                assert!(!results.is_empty());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_definitions);
criterion_main!(benches);
