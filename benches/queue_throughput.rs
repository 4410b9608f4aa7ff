//! Benchmarks for buffer queues and transport mailboxes

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flowgraph::{Buffer, LocalCluster, Queue, Tag, Transport};
use std::thread;

fn bench_queue_ping_pong(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_ping_pong");

    for bufcount in [1, 4, 16].iter() {
        let rounds = 1000;
        group.throughput(Throughput::Elements(rounds as u64));

        group.bench_with_input(BenchmarkId::from_parameter(bufcount), bufcount, |b, &bufcount| {
            b.iter(|| {
                let forward = Queue::new();
                let back = Queue::new();
                for _ in 0..bufcount {
                    back.write(Buffer::new(4096)).unwrap();
                }

                thread::scope(|s| {
                    s.spawn(|| {
                        for i in 0..rounds {
                            let mut buf = back.read().unwrap();
                            buf.set_len(black_box(i % 4096));
                            forward.write(buf).unwrap();
                        }
                        forward.deactivate();
                    });

                    s.spawn(|| {
                        while let Some(buf) = forward.read() {
                            black_box(buf.len());
                            // The producer may already be done
                            let _ = back.write(buf);
                        }
                    });
                });
            });
        });
    }

    group.finish();
}

fn bench_mailbox_send_recv(c: &mut Criterion) {
    let mut group = c.benchmark_group("mailbox_send_recv");

    for size in [64, 4096, 65536].iter() {
        let messages = 200;
        group.throughput(Throughput::Bytes((size * messages) as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let payload = vec![7u8; size];
            b.iter(|| {
                let mut eps = LocalCluster::new(2).into_endpoints();
                let receiver = eps.pop().unwrap();
                let sender = eps.pop().unwrap();

                thread::scope(|s| {
                    s.spawn(|| {
                        for _ in 0..messages {
                            sender.send(1, Tag::Payload, black_box(&payload)).unwrap();
                        }
                        sender.send(1, Tag::ScatterDone, &[]).unwrap();
                    });

                    s.spawn(|| loop {
                        let msg = receiver.recv(&[Tag::Payload, Tag::ScatterDone]).unwrap();
                        if msg.tag == Tag::ScatterDone {
                            break;
                        }
                        black_box(msg.len());
                    });
                });
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_queue_ping_pong, bench_mailbox_send_recv);
criterion_main!(benches);
