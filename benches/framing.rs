use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rush_net::prelude::*;
use rush_net::protocol::{Decoded, Framer};
use std::{
    cell::Cell,
    io::{Read, Write},
    net::TcpStream,
    rc::Rc,
    time::Duration,
};

fn length_stream(frames: usize, size: usize) -> Vec<u8> {
    let payload = vec![0xAB; size];
    let mut bytes = Vec::with_capacity(frames * (size + 4));
    for _ in 0..frames {
        bytes.extend_from_slice(&(size as u32).to_be_bytes());
        bytes.extend_from_slice(&payload);
    }
    bytes
}

fn line_stream(frames: usize, size: usize) -> Vec<u8> {
    let mut line = vec![b'x'; size];
    line.push(b'\n');
    line.repeat(frames)
}

fn http_stream(frames: usize) -> Vec<u8> {
    let request: &[u8] =
        b"POST /api/items HTTP/1.1\r\nHost: bench\r\nContent-Type: text/plain\r\nContent-Length: 16\r\n\r\n0123456789abcdef";
    request.repeat(frames)
}

fn drain(protocol: &dyn Protocol, input: &[u8], chunk: usize) -> usize {
    let mut framer = Framer::new();
    let mut buffer = Vec::with_capacity(chunk * 2);
    let mut delivered = 0;
    for piece in input.chunks(chunk) {
        buffer.extend_from_slice(piece);
        while let Decoded::Frame(frame) = framer.next(protocol, &mut buffer) {
            delivered += protocol.payload(&frame).len();
        }
    }
    delivered
}

fn benchmark_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing");

    let cases: Vec<(&str, Box<dyn Protocol>, Vec<u8>)> = vec![
        ("length_prefixed", Box::new(LengthPrefixed::default()), length_stream(1000, 256)),
        ("line_delimited", Box::new(LineDelimited::default()), line_stream(1000, 256)),
        ("http", Box::new(HttpFraming::default()), http_stream(1000)),
    ];

    for (name, protocol, input) in &cases {
        group.throughput(Throughput::Bytes(input.len() as u64));
        for chunk in [64, 4096, 65535] {
            group.bench_with_input(
                BenchmarkId::new(*name, chunk),
                &chunk,
                |b, &chunk| b.iter(|| drain(protocol.as_ref(), black_box(input), chunk)),
            );
        }
    }

    group.finish();
}

struct Echo {
    echoed: Rc<Cell<usize>>,
}

impl Handler for Echo {
    fn on_message(&self, conn: &mut Conn<'_>, line: &[u8]) -> anyhow::Result<()> {
        conn.send_message(line);
        self.echoed.set(self.echoed.get() + 1);
        Ok(())
    }
}

fn benchmark_loopback_echo(c: &mut Criterion) {
    let echoed = Rc::new(Cell::new(0));
    let config = ServerConfig::builder()
        .address("127.0.0.1:0".parse().unwrap())
        .protocol(LineDelimited::default())
        .build();
    let server = Server::new(
        config,
        Echo {
            echoed: Rc::clone(&echoed),
        },
    )
    .unwrap();
    let mut reactor = NetReactor::new().unwrap();
    let mut table = ConnectionTable::new();
    let address = server.listen(&mut reactor).unwrap();

    let mut client = TcpStream::connect(address).unwrap();
    client.set_nodelay(true).unwrap();
    while table.is_empty() {
        reactor
            .turn(&mut table, Some(Duration::from_millis(10)))
            .unwrap();
    }

    let mut group = c.benchmark_group("loopback");
    let message = b"the quick brown fox jumps over the lazy dog\n";
    let mut reply = vec![0u8; message.len()];
    group.throughput(Throughput::Bytes(message.len() as u64));
    group.bench_function("echo_round_trip", |b| {
        b.iter(|| {
            let before = echoed.get();
            client.write_all(message).unwrap();
            while echoed.get() == before {
                reactor
                    .turn(&mut table, Some(Duration::from_millis(10)))
                    .unwrap();
            }
            client.read_exact(&mut reply).unwrap();
            black_box(&reply);
        })
    });
    group.finish();
}

criterion_group!(benches, benchmark_framing, benchmark_loopback_echo);
criterion_main!(benches);
