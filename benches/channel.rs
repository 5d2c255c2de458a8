//! Channel benchmarks: telaio vs flume vs kanal.
//!
//! **Scenario**: a producer thread streams integers to a consumer through
//! a bounded channel.
//!
//! ```text
//! ┌─────────────┐         ┌─────────────┐
//! │  Producer   │ ──────► │  Consumer   │
//! │  Thread 1   │  10K    │  bench loop │
//! └─────────────┘  msgs   └─────────────┘
//! ```
//!
//! The comparison is honest about what it measures: telaio's channel is a
//! mutex-protected matching structure with sender-protocol completions
//! (one allocation per parked op), while flume and kanal are dedicated
//! channel crates with blocking fast paths. The interesting number is the
//! overhead factor, not the winner.

use criterion::{Criterion, criterion_group, criterion_main};

use telaio::channel::{Channel, OverflowPolicy};
use telaio::exec::sync_wait;

const MESSAGES: usize = 10_000;
const BUFFER: usize = 256;

fn telaio_buffered(c: &mut Criterion) {
    c.bench_function("telaio_buffered_stream", |b| {
        b.iter(|| {
            let chan = Channel::bounded(BUFFER, OverflowPolicy::Suspend);
            let (start_tx, start_rx) = crossbeam_channel::bounded::<()>(0);
            let producer = std::thread::spawn({
                let chan = chan.clone();
                move || {
                    start_rx.recv().unwrap();
                    for i in 0..MESSAGES {
                        sync_wait(chan.send_async(i)).unwrap();
                    }
                }
            });
            start_tx.send(()).unwrap();
            let mut total = 0;
            for _ in 0..MESSAGES {
                total += sync_wait(chan.receive_async()).unwrap().unwrap();
            }
            producer.join().unwrap();
            assert_eq!(total, MESSAGES * (MESSAGES - 1) / 2);
        })
    });
}

fn flume_buffered(c: &mut Criterion) {
    c.bench_function("flume_buffered_stream", |b| {
        b.iter(|| {
            let (tx, rx) = flume::bounded(BUFFER);
            let producer = std::thread::spawn(move || {
                for i in 0..MESSAGES {
                    tx.send(i).unwrap();
                }
            });
            let total: usize = rx.iter().take(MESSAGES).sum();
            producer.join().unwrap();
            assert_eq!(total, MESSAGES * (MESSAGES - 1) / 2);
        })
    });
}

fn kanal_buffered(c: &mut Criterion) {
    c.bench_function("kanal_buffered_stream", |b| {
        b.iter(|| {
            let (tx, rx) = kanal::bounded(BUFFER);
            let producer = std::thread::spawn(move || {
                for i in 0..MESSAGES {
                    tx.send(i).unwrap();
                }
            });
            let mut total = 0;
            for _ in 0..MESSAGES {
                total += rx.recv().unwrap();
            }
            producer.join().unwrap();
            assert_eq!(total, MESSAGES * (MESSAGES - 1) / 2);
        })
    });
}

criterion_group!(benches, telaio_buffered, flume_buffered, kanal_buffered);
criterion_main!(benches);
