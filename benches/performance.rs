use agent_runtime::history::{estimate_tokens, is_approaching_limit, reduce, HistoryReductionConfig};
use agent_runtime::types::FunctionResultContent;
use agent_runtime::{ContentItem, Message};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;

fn create_messages(count: usize, text_size: usize) -> Vec<Message> {
    let text = "a".repeat(text_size);
    (0..count)
        .map(|i| {
            if i == 0 {
                Message::system(&text)
            } else if i % 2 == 0 {
                Message::user(&text)
            } else {
                Message::assistant(vec![ContentItem::text(&text)])
            }
        })
        .collect()
}

fn create_messages_with_tools(count: usize) -> Vec<Message> {
    let mut messages = vec![Message::system("You are a helpful assistant")];

    for i in 0..count {
        if i % 3 == 0 {
            messages.push(Message::user("Calculate 2 + 2"));
        } else if i % 3 == 1 {
            let call_id = format!("call_{i}");
            messages.push(Message::assistant(vec![ContentItem::function_call(
                &call_id,
                "calculator",
                json!({"operation": "add", "a": 2, "b": 2}),
            )]));
        } else {
            let call_id = format!("call_{}", i - 1);
            messages.push(Message::tool_results(vec![FunctionResultContent {
                call_id,
                result: json!({"result": 4}),
            }]));
        }
    }

    messages
}

fn bench_estimate_tokens_by_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("estimate_tokens_by_count");

    for count in [0, 1, 5, 10, 20, 50, 100].iter() {
        let messages = create_messages(*count, 100);
        group.bench_with_input(BenchmarkId::from_parameter(count), &messages, |b, msgs| {
            b.iter(|| estimate_tokens(black_box(msgs)));
        });
    }

    group.finish();
}

fn bench_estimate_tokens_by_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("estimate_tokens_by_size");

    for size in [10, 100, 1000, 10000].iter() {
        let messages = create_messages(10, *size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &messages, |b, msgs| {
            b.iter(|| estimate_tokens(black_box(msgs)));
        });
    }

    group.finish();
}

fn bench_estimate_tokens_with_tools(c: &mut Criterion) {
    let mut group = c.benchmark_group("estimate_tokens_with_tools");

    for count in [3, 9, 30, 90].iter() {
        let messages = create_messages_with_tools(*count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &messages, |b, msgs| {
            b.iter(|| estimate_tokens(black_box(msgs)));
        });
    }

    group.finish();
}

fn bench_reduce(c: &mut Criterion) {
    let mut group = c.benchmark_group("reduce");

    let test_cases = vec![
        ("small_keep_5", create_messages(20, 100), 5usize),
        ("medium_keep_10", create_messages(50, 100), 10),
        ("large_keep_20", create_messages(100, 100), 20),
    ];

    for (name, messages, keep) in test_cases {
        let config = HistoryReductionConfig {
            enabled: true,
            context_window_size: None,
            target_message_count: keep,
            ..HistoryReductionConfig::default()
        };
        group.bench_with_input(
            BenchmarkId::new(name, format!("{}/{}", messages.len(), keep)),
            &(messages, config),
            |b, (msgs, cfg)| {
                b.iter(|| reduce(black_box(msgs), black_box(cfg)));
            },
        );
    }

    group.finish();
}

fn bench_reduce_with_tools(c: &mut Criterion) {
    let mut group = c.benchmark_group("reduce_with_tools");

    let config = HistoryReductionConfig {
        enabled: true,
        context_window_size: None,
        target_message_count: 10,
        ..HistoryReductionConfig::default()
    };

    for count in [30, 90].iter() {
        let messages = create_messages_with_tools(*count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &messages, |b, msgs| {
            b.iter(|| reduce(black_box(msgs), black_box(&config)));
        });
    }

    group.finish();
}

fn bench_is_approaching_limit(c: &mut Criterion) {
    let mut group = c.benchmark_group("is_approaching_limit");

    for count in [10, 50, 100].iter() {
        let messages = create_messages(*count, 500);
        group.bench_with_input(BenchmarkId::from_parameter(count), &messages, |b, msgs| {
            b.iter(|| is_approaching_limit(black_box(msgs), black_box(32000), black_box(0.9)));
        });
    }

    group.finish();
}

fn bench_realistic_workflow(c: &mut Criterion) {
    let mut group = c.benchmark_group("realistic_workflow");

    let messages = create_messages(50, 200);
    let config = HistoryReductionConfig {
        enabled: true,
        context_window_size: None,
        target_message_count: 10,
        ..HistoryReductionConfig::default()
    };

    group.bench_function("check_and_reduce", |b| {
        b.iter(|| {
            let msgs = black_box(&messages);
            let tokens = estimate_tokens(msgs);
            if tokens > black_box(10000) {
                reduce(msgs, black_box(&config)).messages
            } else {
                msgs.to_vec()
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_estimate_tokens_by_count,
    bench_estimate_tokens_by_size,
    bench_estimate_tokens_with_tools,
    bench_reduce,
    bench_reduce_with_tools,
    bench_is_approaching_limit,
    bench_realistic_workflow,
);
criterion_main!(benches);
