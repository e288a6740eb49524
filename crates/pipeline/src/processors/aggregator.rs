//! Turn aggregation
//!
//! Buffers text fragments for one speaker and commits them to the
//! conversation context as a single turn when the speaker's turn ends.
//!
//! | role      | start boundary        | stop boundary                       | joiner |
//! |-----------|-----------------------|-------------------------------------|--------|
//! | user      | `UserStartedSpeaking` | `UserStoppedSpeaking`               | space  |
//! | assistant | `ResponseStarted`     | `ResponseComplete` / `Interruption` | none   |
//!
//! The user aggregator also commits when text has been buffered for longer
//! than the turn timeout without a stop boundary. An assistant turn stays open
//! until the reply completes or is interrupted, however long synthesis takes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use voicebot_core::{ControlFrame, ConversationContext, Frame, FrameProcessor, ProcessorContext, Result, TurnRole};

#[derive(Debug, Default)]
struct AggregatorState {
    fragments: Vec<String>,
    /// Between start and stop boundaries
    active: bool,
    /// When the first fragment of the pending turn arrived
    buffered_since: Option<Instant>,
}

/// Collects fragments for one role into turns
pub struct TurnAggregator {
    role: TurnRole,
    context: ConversationContext,
    turn_timeout: Duration,
    state: Mutex<AggregatorState>,
}

impl TurnAggregator {
    /// Aggregator for user transcripts
    pub fn user(context: ConversationContext, turn_timeout: Duration) -> Self {
        Self::new(TurnRole::User, context, turn_timeout)
    }

    /// Aggregator for model output
    pub fn assistant(context: ConversationContext, turn_timeout: Duration) -> Self {
        Self::new(TurnRole::Assistant, context, turn_timeout)
    }

    fn new(role: TurnRole, context: ConversationContext, turn_timeout: Duration) -> Self {
        Self {
            role,
            context,
            turn_timeout,
            state: Mutex::new(AggregatorState::default()),
        }
    }

    pub fn role(&self) -> TurnRole {
        self.role
    }

    fn is_start(&self, control: ControlFrame) -> bool {
        match self.role {
            TurnRole::User => control == ControlFrame::UserStartedSpeaking,
            _ => control == ControlFrame::ResponseStarted,
        }
    }

    fn is_stop(&self, control: ControlFrame) -> bool {
        match self.role {
            TurnRole::User => control == ControlFrame::UserStoppedSpeaking,
            _ => matches!(control, ControlFrame::ResponseComplete | ControlFrame::Interruption),
        }
    }

    /// Commit the buffered fragments, returning true if a turn was appended
    fn commit(&self, state: &mut AggregatorState) -> bool {
        let fragments = std::mem::take(&mut state.fragments);
        state.buffered_since = None;

        let content = match self.role {
            TurnRole::User => fragments
                .iter()
                .map(|f| f.trim())
                .filter(|f| !f.is_empty())
                .collect::<Vec<_>>()
                .join(" "),
            _ => fragments.concat().trim().to_string(),
        };

        if content.is_empty() {
            return false;
        }

        match self.context.append(self.role, content) {
            Some(turn) => {
                tracing::debug!(role = %turn.role, sequence = turn.sequence, chars = turn.content.len(), "Turn committed");
                metrics::counter!("voicebot_turns_total", "role" => self.role.as_str()).increment(1);
                true
            }
            None => false,
        }
    }

    /// Frames to emit after a turn was committed
    fn on_commit(&self, committed: bool) -> Option<Frame> {
        (committed && self.role == TurnRole::User).then_some(Frame::Control(ControlFrame::RunModel))
    }
}

#[async_trait]
impl FrameProcessor for TurnAggregator {
    async fn process(&self, frame: Frame, _context: &mut ProcessorContext) -> Result<Vec<Frame>> {
        match frame {
            Frame::Text { ref text, role, .. } if role == self.role => {
                let mut state = self.state.lock();
                if !state.active && state.fragments.is_empty() {
                    tracing::debug!(role = %self.role, "Discarding fragment outside of a turn");
                    return Ok(vec![]);
                }
                state.fragments.push(text.clone());
                state.buffered_since.get_or_insert_with(Instant::now);
                drop(state);
                Ok(vec![frame])
            }
            Frame::Control(control) if self.is_start(control) => {
                let mut state = self.state.lock();
                state.active = true;
                if self.role != TurnRole::User {
                    // A new reply never continues the previous one
                    state.fragments.clear();
                    state.buffered_since = None;
                }
                Ok(vec![frame])
            }
            Frame::Control(control) if self.is_stop(control) => {
                let committed = {
                    let mut state = self.state.lock();
                    state.active = false;
                    self.commit(&mut state)
                };
                let mut out = vec![frame];
                out.extend(self.on_commit(committed));
                Ok(out)
            }
            Frame::Control(ControlFrame::Cancel) => {
                let mut state = self.state.lock();
                *state = AggregatorState::default();
                Ok(vec![frame])
            }
            other => Ok(vec![other]),
        }
    }

    fn name(&self) -> &'static str {
        match self.role {
            TurnRole::User => "user_aggregator",
            _ => "assistant_aggregator",
        }
    }

    fn idle_interval(&self) -> Option<Duration> {
        (self.role == TurnRole::User)
            .then(|| (self.turn_timeout / 4).clamp(Duration::from_millis(10), Duration::from_millis(250)))
    }

    async fn on_idle(&self, _context: &mut ProcessorContext) -> Result<Vec<Frame>> {
        if self.role != TurnRole::User {
            return Ok(vec![]);
        }
        let committed = {
            let mut state = self.state.lock();
            match state.buffered_since {
                Some(since) if since.elapsed() >= self.turn_timeout => {
                    tracing::debug!(role = %self.role, "Turn timed out, committing buffered text");
                    state.active = false;
                    self.commit(&mut state)
                }
                _ => return Ok(vec![]),
            }
        };
        Ok(self.on_commit(committed).into_iter().collect())
    }
}
