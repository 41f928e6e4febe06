use std::env;
use std::sync::Arc;
use std::time::Duration;

use criterion::{Criterion, black_box};

use ember_core::executor::testing::InlineExecutor;
use ember_core::ids::ChannelId;
use ember_core::observability::{Logger, MetricsProvider, NoopObservability};
use ember_core::promise::Promise;
use ember_core::{Address, Context, Executor, Handler, Message, Pipeline};
use ember_core::pipeline::PipelineSink;

/// Measures the cost of a full inbound+outbound round trip through a
/// pipeline with a handful of pass-through handlers — the shape a real
/// protocol stack (framing, then a codec, then the application handler)
/// looks like, minus any actual encoding work.
///
/// # 设计背景（Why）
/// - 流水线的分发开销（而非某个具体编解码器的开销）是这个 crate 的核心性能契约；
///   这个基准只关心每个 context 之间的转发成本。
/// - 三层 pass-through handler 模拟一个典型协议栈的处理器数量级。
fn bench_pipeline_dispatch(c: &mut Criterion) {
    let sink = Arc::new(SinkStub::default());
    let executor: Arc<dyn Executor> = Arc::new(InlineExecutor::new());
    let pipeline = Pipeline::new(sink, executor);
    pipeline.add_last("framing", Arc::new(PassThrough)).unwrap();
    pipeline.add_last("codec", Arc::new(PassThrough)).unwrap();
    pipeline.add_last("application", Arc::new(PassThrough)).unwrap();
    pipeline.fire_channel_registered();
    pipeline.fire_channel_active();

    c.bench_function("pipeline_dispatch_read_then_write", |b| {
        b.iter(|| {
            pipeline.fire_channel_read(Message::opaque(1u32));
            pipeline.fire_channel_read_complete();
            let promise: Promise<()> = Promise::new();
            pipeline.write(Message::opaque(1u32), promise.clone());
            pipeline.flush();
            black_box(promise.is_done());
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

    bench_pipeline_dispatch(&mut criterion);
    criterion.final_summary();
}

struct PassThrough;

impl Handler for PassThrough {
    fn on_channel_read(&self, ctx: &dyn Context, msg: Message) {
        ctx.fire_channel_read(msg);
    }

    fn on_channel_read_complete(&self, ctx: &dyn Context) {
        ctx.fire_channel_read_complete();
    }

    fn on_write(&self, ctx: &dyn Context, msg: Message, promise: Promise<()>) {
        ctx.write(msg, promise);
    }

    fn on_flush(&self, ctx: &dyn Context) {
        ctx.flush();
    }
}

#[derive(Default)]
struct SinkStub;

impl PipelineSink for SinkStub {
    fn channel_id(&self) -> ChannelId {
        ChannelId::from_fields(0, 0, 0, 0, 0)
    }

    fn logger(&self) -> Arc<dyn Logger> {
        Arc::new(NoopObservability)
    }

    fn metrics(&self) -> Arc<dyn MetricsProvider> {
        Arc::new(NoopObservability)
    }

    fn sink_register(&self, promise: Promise<()>) {
        promise.complete(());
    }
    fn sink_bind(&self, _local: Address, promise: Promise<()>) {
        promise.complete(());
    }
    fn sink_connect(&self, _remote: Address, _local: Option<Address>, promise: Promise<()>) {
        promise.complete(());
    }
    fn sink_disconnect(&self, promise: Promise<()>) {
        promise.complete(());
    }
    fn sink_close(&self, promise: Promise<()>) {
        promise.complete(());
    }
    fn sink_deregister(&self, promise: Promise<()>) {
        promise.complete(());
    }
    fn sink_read_requested(&self) {}
    fn sink_write(&self, _msg: Message, promise: Promise<()>) {
        promise.complete(());
    }
    fn sink_flush(&self) {}
    fn sink_close_forcibly(&self) {}
}
