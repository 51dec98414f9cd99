use std::collections::VecDeque;
use std::hint::black_box;

use bencher::{TestCase, TestFile};
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use http::Method;
use micro_client::codec::{FeedOutcome, ResponseParser};

static SMALL: TestFile = TestFile::new("small.txt", include_str!("../resources/response/small.txt"));
static LARGE: TestFile = TestFile::new("large.txt", include_str!("../resources/response/large.txt"));
static CHUNKED: TestFile = TestFile::new("chunked.txt", include_str!("../resources/response/chunked.txt"));
static PIPELINED: TestFile = TestFile::new("pipelined.txt", include_str!("../resources/response/pipelined.txt"));

fn create_test_cases() -> Vec<TestCase> {
    vec![
        TestCase::small("small_response", SMALL),
        TestCase::normal("large_header_response", LARGE),
        TestCase::normal("chunked_response", CHUNKED),
        TestCase::normal("pipelined_responses", PIPELINED),
    ]
}

fn parser_for(file: &TestFile) -> ResponseParser {
    let mut parser = ResponseParser::default();
    for _ in 0..file.responses() {
        parser.expect_response(Method::GET, false);
    }
    parser
}

fn benchmark_response_parser(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("response_parser");

    for case in create_test_cases() {
        let content = case.file().content();
        group.throughput(Throughput::Bytes(content.len() as u64));

        group.bench_with_input(BenchmarkId::new("single_feed", case.name()), &case, |b, _| {
            b.iter_batched_ref(
                || (parser_for(case.file()), VecDeque::with_capacity(16)),
                |(parser, events)| {
                    let outcome = parser.feed(content.as_bytes(), events);
                    assert!(matches!(outcome, FeedOutcome::ConsumedAll), "input should be valid http responses");
                    black_box(events.len());
                },
                BatchSize::SmallInput,
            );
        });

        group.bench_with_input(BenchmarkId::new("byte_by_byte", case.name()), &case, |b, _| {
            b.iter_batched_ref(
                || (parser_for(case.file()), VecDeque::with_capacity(content.len())),
                |(parser, events)| {
                    for byte in content.as_bytes().chunks(1) {
                        black_box(parser.feed(byte, events));
                    }
                    black_box(events.len());
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(decoder, benchmark_response_parser);
criterion_main!(decoder);
