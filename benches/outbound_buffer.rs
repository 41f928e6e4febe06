use std::env;
use std::sync::Arc;
use std::time::Duration;

use criterion::{Criterion, black_box};

use ember_core::buffer::{
    DefaultMessageSizeEstimator, Message, MessageSizeEstimator, NoopWritabilityListener,
    OutboundBuffer,
};
use ember_core::promise::Promise;

/// Measures the add/flush/drain cycle of [`OutboundBuffer`] under a watermark
/// tight enough to flip writability on every iteration — the worst case for
/// the watermark accounting, since every `add_message` and `remove` touches
/// the atomic bitset rather than leaving it alone.
///
/// # 设计背景（Why）
/// - 出站缓冲区的水位账目是这个 crate 对外承诺的可观测性契约之一；基准验证
///   CAS 重试路径不会成为吞吐量瓶颈。
fn bench_outbound_buffer(c: &mut Criterion) {
    let estimator: Arc<dyn MessageSizeEstimator> = Arc::new(DefaultMessageSizeEstimator::default());
    let listener = Arc::new(NoopWritabilityListener);

    c.bench_function("outbound_buffer_add_flush_drain", |b| {
        b.iter(|| {
            let mut buffer = OutboundBuffer::new(64, 0, estimator.clone(), listener.clone());
            for _ in 0..16 {
                buffer.add_message(Message::opaque(1u32), Promise::new());
            }
            buffer.add_flush();
            while buffer.remove() {}
            black_box(buffer.is_writable());
        });
    });
}

fn main() {
    let mut quick_mode = false;
    for arg in env::args().skip(1) {
        if arg == "--quick" {
            quick_mode = true;
        }
    }

    let mut criterion = Criterion::default();
    if quick_mode {
        criterion = criterion
            .sample_size(10)
            .warm_up_time(Duration::from_millis(100))
            .measurement_time(Duration::from_millis(250));
    }

    bench_outbound_buffer(&mut criterion);
    criterion.final_summary();
}
