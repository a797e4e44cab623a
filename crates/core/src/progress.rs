use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

/// Steps of one transient-detection or merge invocation, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MergeStage {
    Loaded,
    GridsBuilt,
    EllipsoidsBuilt,
    Classified,
    Decided,
    Emitted,
}

impl fmt::Display for MergeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeStage::Loaded => "loaded",
            MergeStage::GridsBuilt => "grids built",
            MergeStage::EllipsoidsBuilt => "ellipsoids built",
            MergeStage::Classified => "classified",
            MergeStage::Decided => "decided",
            MergeStage::Emitted => "emitted",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    Stage { stage: MergeStage },
    Advance { stage: Option<MergeStage>, fraction: f32 },
}

pub type ProgressSink = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

#[derive(Default)]
struct ProgressContext {
    sink: Option<ProgressSink>,
    stage: Option<MergeStage>,
}

thread_local! {
    static CONTEXT: RefCell<ProgressContext> = RefCell::new(ProgressContext::default());
}

pub struct ProgressGuard {
    prev: ProgressContext,
}

impl Drop for ProgressGuard {
    fn drop(&mut self) {
        let prev = std::mem::take(&mut self.prev);
        CONTEXT.with(|ctx| {
            *ctx.borrow_mut() = prev;
        });
    }
}

/// Routes progress from this thread to `sink` until the guard drops.
pub fn set_progress_sink(sink: Option<ProgressSink>) -> ProgressGuard {
    let prev = CONTEXT.with(|ctx| {
        std::mem::replace(&mut *ctx.borrow_mut(), ProgressContext { sink, stage: None })
    });
    ProgressGuard { prev }
}

pub fn report_stage(stage: MergeStage) {
    tracing::debug!("stage: {stage}");
    CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        ctx.stage = Some(stage);
        if let Some(sink) = ctx.sink.as_ref() {
            (sink)(ProgressEvent::Stage { stage });
        }
    });
}

pub fn report_progress(fraction: f32) {
    let fraction = fraction.clamp(0.0, 1.0);
    CONTEXT.with(|ctx| {
        let ctx = ctx.borrow();
        if let Some(sink) = ctx.sink.as_ref() {
            (sink)(ProgressEvent::Advance {
                stage: ctx.stage,
                fraction,
            });
        }
    });
}
