//! Channel-based stage pipeline
//!
//! Connects FrameProcessors with bounded tokio channels. Each stage runs in
//! its own task, so frames leave a stage in the order it emitted them and
//! reach the tail in the order the first emitting stage produced them.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use voicebot_core::{ControlFrame, Frame, FrameProcessor, ProcessorContext, Result};

/// Channel capacity for inter-stage communication
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// A fixed, ordered chain of frame processors
pub struct Pipeline {
    name: String,
    processors: Vec<Arc<dyn FrameProcessor>>,
    channel_capacity: usize,
}

/// Handles to a pipeline whose stages are running
pub struct RunningPipeline {
    /// Head of the pipeline
    pub input: mpsc::Sender<Frame>,
    /// Frames leaving the last stage
    pub output: mpsc::Receiver<Frame>,
    /// One handle per stage task
    pub handles: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            processors: Vec::new(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    /// Add a processor to the end of the chain
    pub fn add<P: FrameProcessor + 'static>(&mut self, processor: P) -> &mut Self {
        self.processors.push(Arc::new(processor));
        self
    }

    pub fn add_shared(&mut self, processor: Arc<dyn FrameProcessor>) -> &mut Self {
        self.processors.push(processor);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Stage names, head first
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    /// Process a single frame through every stage synchronously
    ///
    /// Frames a stage pushes through its context come before the frames it
    /// returns. Error frames skip the processors.
    pub async fn process_one(&self, frame: Frame, context: &mut ProcessorContext) -> Result<Vec<Frame>> {
        let mut frames = vec![frame];

        for processor in &self.processors {
            let mut next_frames = Vec::new();

            for f in frames {
                if f.is_error() || !processor.can_handle(&f) {
                    next_frames.push(f);
                    continue;
                }
                let output = processor.process(f, context).await?;
                next_frames.extend(context.take_pending());
                next_frames.extend(output);
            }

            frames = next_frames;
        }

        Ok(frames)
    }

    /// Spawn one task per stage and connect them with channels
    ///
    /// Every stage gets a clone of `context` wired to its downstream sender
    /// and to `cancel`. When `cancel` fires each stage hands its processor a
    /// [`ControlFrame::Cancel`] and exits.
    pub fn run(&self, context: ProcessorContext, cancel: CancellationToken) -> RunningPipeline {
        let (input_tx, input_rx) = mpsc::channel::<Frame>(self.channel_capacity);
        let mut handles = Vec::with_capacity(self.processors.len());
        let mut current_rx = input_rx;

        for processor in &self.processors {
            let (next_tx, next_rx) = mpsc::channel::<Frame>(self.channel_capacity);
            let stage_context = context
                .clone()
                .with_downstream(next_tx.clone())
                .with_cancellation(cancel.clone());

            handles.push(tokio::spawn(run_stage(
                Arc::clone(processor),
                stage_context,
                current_rx,
                next_tx,
                cancel.clone(),
            )));

            current_rx = next_rx;
        }

        if self.processors.is_empty() {
            // Nothing to run: the head feeds the tail directly
            let (output_tx, output_rx) = mpsc::channel::<Frame>(self.channel_capacity);
            let mut rx = current_rx;
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        frame = rx.recv() => frame,
                    };
                    let Some(frame) = frame else { break };
                    if output_tx.send(frame).await.is_err() {
                        break;
                    }
                }
            }));
            current_rx = output_rx;
        }

        tracing::debug!(pipeline = %self.name, stages = self.processors.len(), "Pipeline started");

        RunningPipeline {
            input: input_tx,
            output: current_rx,
            handles,
        }
    }
}

async fn run_stage(
    processor: Arc<dyn FrameProcessor>,
    mut context: ProcessorContext,
    mut rx: mpsc::Receiver<Frame>,
    tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) {
    let stage = processor.name();

    if let Err(e) = processor.on_start(&mut context).await {
        tracing::error!(stage, error = %e, "Processor on_start failed");
        let _ = tx.send(Frame::error(stage, &e)).await;
    }

    let mut ticker = processor.idle_interval().map(idle_ticker);

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Let the stage drop buffers and abort detached work. Its
                // output has nowhere meaningful to go any more.
                if let Err(e) = processor.process(Frame::Control(ControlFrame::Cancel), &mut context).await {
                    tracing::debug!(stage, error = %e, "Processor failed while cancelling");
                }
                context.take_pending();
                break;
            }
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = tick(&mut ticker) => {
                let result = processor.on_idle(&mut context).await;
                if !emit(stage, result, &mut context, &tx).await {
                    break;
                }
                continue;
            }
        };

        if frame.is_error() || !processor.can_handle(&frame) {
            if tx.send(frame).await.is_err() {
                break;
            }
            continue;
        }

        let is_eos = frame.is_end_of_stream();
        let result = processor.process(frame, &mut context).await;
        if !emit(stage, result, &mut context, &tx).await || is_eos {
            break;
        }
    }

    if let Err(e) = processor.on_stop(&mut context).await {
        tracing::error!(stage, error = %e, "Processor on_stop failed");
    }

    tracing::debug!(stage, "Stage task exiting");
}

/// Send a processor's result downstream; false once the stage should stop
async fn emit(
    stage: &'static str,
    result: Result<Vec<Frame>>,
    context: &mut ProcessorContext,
    tx: &mpsc::Sender<Frame>,
) -> bool {
    let frames = match result {
        Ok(frames) => frames,
        Err(e) => {
            tracing::error!(stage, error = %e, "Processor error");
            metrics::counter!("voicebot_stage_errors_total", "stage" => stage).increment(1);
            vec![Frame::error(stage, &e)]
        }
    };

    for frame in context.take_pending().into_iter().chain(frames) {
        if tx.send(frame).await.is_err() {
            tracing::debug!(stage, "Output channel closed");
            return false;
        }
    }
    true
}

fn idle_ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Builder for Pipeline
pub struct PipelineBuilder {
    pipeline: Pipeline,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            pipeline: Pipeline::new(name),
        }
    }

    /// Add a processor
    pub fn processor<P: FrameProcessor + 'static>(mut self, processor: P) -> Self {
        self.pipeline.add(processor);
        self
    }

    /// Add a shared processor
    pub fn processor_shared(mut self, processor: Arc<dyn FrameProcessor>) -> Self {
        self.pipeline.add_shared(processor);
        self
    }

    /// Set channel capacity
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.pipeline.channel_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> Pipeline {
        self.pipeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use voicebot_core::{Error, TurnRole};

    struct Passthrough(&'static str);

    #[async_trait]
    impl FrameProcessor for Passthrough {
        async fn process(&self, frame: Frame, _context: &mut ProcessorContext) -> Result<Vec<Frame>> {
            Ok(vec![frame])
        }

        fn name(&self) -> &'static str {
            self.0
        }
    }

    /// Splits every text frame into one frame per word, pushing all but the last
    struct WordSplitter;

    #[async_trait]
    impl FrameProcessor for WordSplitter {
        async fn process(&self, frame: Frame, context: &mut ProcessorContext) -> Result<Vec<Frame>> {
            match frame {
                Frame::Text { text, role, .. } => {
                    let words: Vec<&str> = text.split_whitespace().collect();
                    let Some((last, rest)) = words.split_last() else {
                        return Ok(vec![]);
                    };
                    for word in rest {
                        context
                            .push(Frame::Text { text: word.to_string(), role, is_final: true })
                            .await?;
                    }
                    Ok(vec![Frame::Text { text: last.to_string(), role, is_final: true }])
                }
                other => Ok(vec![other]),
            }
        }

        fn name(&self) -> &'static str {
            "word_splitter"
        }
    }

    struct Failing;

    #[async_trait]
    impl FrameProcessor for Failing {
        async fn process(&self, frame: Frame, _context: &mut ProcessorContext) -> Result<Vec<Frame>> {
            match frame {
                Frame::Text { .. } => Err(Error::Llm("backend unreachable".into())),
                other => Ok(vec![other]),
            }
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[derive(Default)]
    struct CancelRecorder {
        seen: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl FrameProcessor for CancelRecorder {
        async fn process(&self, frame: Frame, _context: &mut ProcessorContext) -> Result<Vec<Frame>> {
            if frame.is(ControlFrame::Cancel) {
                self.seen.lock().push("cancel");
            }
            Ok(vec![frame])
        }

        fn name(&self) -> &'static str {
            "cancel_recorder"
        }
    }

    fn texts(frames: &[Frame]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|f| match f {
                Frame::Text { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_empty_pipeline() {
        let pipeline = Pipeline::new("empty");
        let mut ctx = ProcessorContext::default();

        let frames = pipeline.process_one(Frame::EndOfStream, &mut ctx).await.unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_end_of_stream());
    }

    #[tokio::test]
    async fn test_running_empty_pipeline_forwards_frames() {
        let pipeline = Pipeline::new("empty");
        let mut running = pipeline.run(ProcessorContext::default(), CancellationToken::new());

        running.input.send(Frame::user_text("through")).await.unwrap();
        assert!(matches!(running.output.recv().await, Some(Frame::Text { text, .. }) if text == "through"));

        drop(running.input);
        assert!(running.output.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_process_one_keeps_pushed_frames_first() {
        let pipeline = Pipeline::builder("split")
            .processor(WordSplitter)
            .processor(Passthrough("p1"))
            .build();
        let mut ctx = ProcessorContext::default();

        let frames = pipeline
            .process_one(Frame::user_text("one two three"), &mut ctx)
            .await
            .unwrap();
        assert_eq!(texts(&frames), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_running_pipeline_preserves_order() {
        let pipeline = Pipeline::builder("running")
            .processor(Passthrough("p1"))
            .processor(WordSplitter)
            .processor(Passthrough("p2"))
            .channel_capacity(4)
            .build();
        assert_eq!(pipeline.stage_names(), vec!["p1", "word_splitter", "p2"]);

        let running = pipeline.run(ProcessorContext::new("test-session"), CancellationToken::new());
        let RunningPipeline { input, mut output, .. } = running;

        let producer = tokio::spawn(async move {
            for i in 0..20 {
                input.send(Frame::user_text(format!("a{i} b{i}"))).await.unwrap();
            }
            input.send(Frame::EndOfStream).await.unwrap();
        });

        let mut received = Vec::new();
        while let Some(frame) = output.recv().await {
            let is_eos = frame.is_end_of_stream();
            received.push(frame);
            if is_eos {
                break;
            }
        }
        producer.await.unwrap();

        let expected: Vec<String> = (0..20).flat_map(|i| [format!("a{i}"), format!("b{i}")]).collect();
        assert_eq!(texts(&received), expected);
    }

    #[tokio::test]
    async fn test_stage_error_becomes_error_frame() {
        let pipeline = Pipeline::builder("errors")
            .processor(Failing)
            .processor(Passthrough("after"))
            .build();
        let RunningPipeline { input, mut output, .. } =
            pipeline.run(ProcessorContext::default(), CancellationToken::new());

        input.send(Frame::user_text("boom")).await.unwrap();
        match output.recv().await.unwrap() {
            Frame::Error { stage, recoverable, message } => {
                assert_eq!(stage, "failing");
                assert!(!recoverable);
                assert!(message.contains("backend unreachable"));
            }
            other => panic!("unexpected frame {other:?}"),
        }

        // The stage survives its own failure
        input
            .send(Frame::Text { text: String::new(), role: TurnRole::System, is_final: true })
            .await
            .unwrap();
        assert!(output.recv().await.unwrap().is_error());
    }

    #[tokio::test]
    async fn test_cancel_stops_stages() {
        let recorder = CancelRecorder::default();
        let seen = recorder.seen.clone();
        let pipeline = Pipeline::builder("cancel").processor(recorder).build();
        let cancel = CancellationToken::new();
        let RunningPipeline { input, handles, .. } = pipeline.run(ProcessorContext::default(), cancel.clone());

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*seen.lock(), vec!["cancel"]);
        assert!(input.send(Frame::EndOfStream).await.is_err());
    }
}
