use std::hint::black_box;

use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use http::{HeaderName, HeaderValue, Method};
use micro_client::codec::{RequestEncoder, RequestHead};
use micro_client::handler::buffered;
use micro_client::protocol::{HeaderList, Message, PayloadSize, RequestDescriptor};
use micro_client::{Client, ClientConfig, Dispatch};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::runtime::Runtime;
use tokio_util::codec::Encoder;

const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nContent-Length: 12\r\n\r\nHello World!";

/// Answers every request head it reads with `RESPONSE`.
async fn serve(mut io: DuplexStream) {
    let mut buf = BytesMut::with_capacity(16 * 1024);
    loop {
        match io.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        while let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let _ = buf.split_to(end + 4);
            if io.write_all(RESPONSE).await.is_err() {
                return;
            }
        }
    }
}

fn start(runtime: &Runtime, depth: usize) -> Client {
    let _guard = runtime.enter();
    let (io, server) = tokio::io::duplex(64 * 1024);
    tokio::spawn(serve(server));
    Client::new(io, ClientConfig::default().pipelining(depth).authority("localhost"))
}

async fn round_trips(client: &Client, count: usize) {
    let mut responses = Vec::with_capacity(count);
    for _ in 0..count {
        let (handler, response) = buffered();
        client.dispatch(RequestDescriptor::get("/"), Box::new(handler)).expect("request should be accepted");
        responses.push(response);
    }
    for response in responses {
        black_box(response.await.expect("handler dropped").expect("request failed"));
    }
}

fn bench_round_trips(c: &mut Criterion) {
    let runtime = Runtime::new().expect("failed to build runtime");
    let mut group = c.benchmark_group("round_trip");

    for (name, depth) in [("sequential", 1), ("pipelined_x8", 8)] {
        let client = start(&runtime, depth);
        group.bench_function(name, |b| b.to_async(&runtime).iter(|| round_trips(&client, 8)));
    }

    group.finish();
}

fn bench_request_encoder(c: &mut Criterion) {
    let headers: HeaderList = [
        (HeaderName::from_static("accept"), HeaderValue::from_static("*/*")),
        (HeaderName::from_static("user-agent"), HeaderValue::from_static("micro-client")),
    ]
    .into_iter()
    .collect();
    let host = HeaderValue::from_static("localhost");

    c.bench_function("encode_get_head", |b| {
        b.iter_batched_ref(
            || BytesMut::with_capacity(1024),
            |dst| {
                let head = RequestHead {
                    method: &Method::GET,
                    path: "/index.html",
                    headers: &headers,
                    host: Some(&host),
                    keep_alive: true,
                    upgrade: None,
                };
                let message = Message::<_, bytes::Bytes>::Header((head, PayloadSize::Empty));
                RequestEncoder::new().encode(message, dst).expect("head should encode");
                black_box(dst.len());
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_round_trips, bench_request_encoder);
criterion_main!(benches);
