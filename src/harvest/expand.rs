//! Drives an infinite-scroll feed until it stops growing.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::ExpansionConfig;
use crate::harvest::scripts;
use crate::model::Cancellation;
use crate::traits::{BrowserSession, Interaction, Key, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpansionState {
    Expanding,
    Stalled,
    Converged,
}

/// Why the expansion loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No growth for `stall_threshold` consecutive iterations.
    Stalled,
    IterationCeiling,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpansionReport {
    pub state: ExpansionState,
    pub reason: StopReason,
    pub iterations: u32,
    pub initial_count: usize,
    pub final_count: usize,
}

pub struct PageExpander {
    config: ExpansionConfig,
}

impl PageExpander {
    pub fn new(config: ExpansionConfig) -> Self {
        Self { config }
    }

    /// Triggers lazy loading until the container count converges, the
    /// iteration ceiling is reached or `cancel` is set.
    ///
    /// Every failure inside the loop is best-effort: a failed trigger or
    /// count is logged and the iteration counts as "no growth".
    #[instrument(skip(self, session, cancel))]
    pub async fn expand<B>(
        &self,
        session: &B,
        container_selector: &str,
        cancel: &Cancellation,
    ) -> ExpansionReport
    where
        B: BrowserSession + ?Sized,
    {
        let initial_count = self.count(session, container_selector, 0).await;
        let mut count = initial_count;
        let mut state = ExpansionState::Expanding;
        let mut stalls = 0u32;
        let mut iterations = 0u32;

        info!(initial_count, "Expanding feed");

        let reason = loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if iterations >= self.config.max_iterations {
                state = ExpansionState::Converged;
                break StopReason::IterationCeiling;
            }
            iterations += 1;

            let before = count;
            self.trigger(session).await;
            self.wait_for_growth(session, container_selector, before)
                .await;
            tokio::time::sleep(self.config.settle()).await;
            count = self.count(session, container_selector, before).await;

            if count > before {
                stalls = 0;
                state = ExpansionState::Expanding;
                debug!(iteration = iterations, count, "Feed grew");
            } else {
                stalls += 1;
                state = ExpansionState::Stalled;
                debug!(iteration = iterations, count, stalls, "No growth");
                if stalls >= self.config.stall_threshold {
                    state = ExpansionState::Converged;
                    break StopReason::Stalled;
                }
            }
        };

        let report = ExpansionReport {
            state,
            reason,
            iterations,
            initial_count,
            final_count: count,
        };
        info!(
            iterations,
            initial_count,
            final_count = count,
            reason = ?reason,
            "Expansion finished"
        );
        report
    }

    /// Primary trigger with the synthetic wheel script as fallback when the
    /// primary fails or leaves the scroll position unchanged.
    async fn trigger<B>(&self, session: &B)
    where
        B: BrowserSession + ?Sized,
    {
        let before = self.offset(session).await;
        let primary = self.primary(session).await;
        let after = self.offset(session).await;
        debug!(?before, ?after, "Scroll offset");

        let needs_fallback = match primary {
            Err(e) => {
                debug!(error = %e, "Primary growth trigger failed");
                true
            }
            Ok(()) => !matches!((before, after), (Some(b), Some(a)) if a != b),
        };

        if needs_fallback {
            let script = scripts::wheel_scroll(self.config.wheel_events, self.config.wheel_delta);
            match session.query(script).await {
                Ok(outcome) => debug!(moved = %outcome["moved"], "Synthetic wheel dispatched"),
                Err(e) => warn!(error = %e, "Synthetic wheel fallback failed"),
            }
        }
    }

    async fn primary<B>(&self, session: &B) -> Result<(), SessionError>
    where
        B: BrowserSession + ?Sized,
    {
        let pause = self.config.step_pause();
        for _ in 0..self.config.scroll_steps {
            session
                .interact(Interaction::ScrollBy {
                    dx: 0,
                    dy: self.config.scroll_delta,
                })
                .await?;
            pause_for(pause).await;
        }
        self.press(session, Key::PageDown, self.config.page_down_presses)
            .await?;
        self.press(session, Key::End, 1).await?;
        self.press(session, Key::ArrowDown, self.config.arrow_down_presses)
            .await
    }

    async fn press<B>(&self, session: &B, key: Key, times: u32) -> Result<(), SessionError>
    where
        B: BrowserSession + ?Sized,
    {
        for _ in 0..times {
            session.interact(Interaction::Press(key)).await?;
            pause_for(self.config.step_pause()).await;
        }
        Ok(())
    }

    /// Polls until the count exceeds `baseline` or the growth timeout
    /// passes.
    async fn wait_for_growth<B>(&self, session: &B, selector: &str, baseline: usize)
    where
        B: BrowserSession + ?Sized,
    {
        let deadline = Instant::now() + self.config.growth_timeout();
        loop {
            if self.count(session, selector, baseline).await > baseline {
                return;
            }
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    async fn count<B>(&self, session: &B, selector: &str, fallback: usize) -> usize
    where
        B: BrowserSession + ?Sized,
    {
        match session.find(selector).await {
            Ok(containers) => containers.len(),
            Err(e) => {
                warn!(error = %e, "Counting containers failed");
                fallback
            }
        }
    }

    async fn offset<B>(&self, session: &B) -> Option<i64>
    where
        B: BrowserSession + ?Sized,
    {
        session
            .query(scripts::scroll_offset())
            .await
            .ok()
            .and_then(|v| v.as_f64())
            .map(|v| v as i64)
    }
}

async fn pause_for(pause: Duration) {
    if !pause.is_zero() {
        tokio::time::sleep(pause).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::sessions::memory::{MemoryContainer, MemorySession};
    use serde_json::json;

    fn fast_config() -> ExpansionConfig {
        ExpansionConfig {
            growth_timeout_ms: 5,
            poll_interval_ms: 1,
            settle_ms: 0,
            scroll_steps: 2,
            page_down_presses: 1,
            arrow_down_presses: 1,
            step_pause_ms: 0,
            ..ExpansionConfig::default()
        }
    }

    fn feed(n: usize) -> Vec<MemoryContainer> {
        (0..n)
            .map(|i| MemoryContainer::new(json!({ "id": format!("c{}", i) })))
            .collect()
    }

    #[tokio::test]
    async fn test_converges_three_iterations_after_growth_stops() {
        let session = MemorySession::new(feed(25)).with_lazy_rendering(5, 5);
        let report = PageExpander::new(fast_config())
            .expand(&session, "div", &Cancellation::new())
            .await;

        assert_eq!(report.state, ExpansionState::Converged);
        assert_eq!(report.reason, StopReason::Stalled);
        assert_eq!(report.initial_count, 5);
        assert_eq!(report.final_count, 25);
        // four growing iterations, then three stalls
        assert_eq!(report.iterations, 7);
    }

    #[tokio::test]
    async fn test_iteration_ceiling_forces_convergence() {
        let session = MemorySession::new(feed(100)).with_lazy_rendering(1, 1);
        let config = ExpansionConfig {
            max_iterations: 4,
            ..fast_config()
        };
        let report = PageExpander::new(config)
            .expand(&session, "div", &Cancellation::new())
            .await;

        assert_eq!(report.state, ExpansionState::Converged);
        assert_eq!(report.reason, StopReason::IterationCeiling);
        assert_eq!(report.iterations, 4);
        assert_eq!(report.final_count, 5);
    }

    #[tokio::test]
    async fn test_broken_input_falls_back_to_wheel_script() {
        let session = MemorySession::new(feed(12))
            .with_lazy_rendering(4, 4)
            .with_broken_input();
        let report = PageExpander::new(fast_config())
            .expand(&session, "div", &Cancellation::new())
            .await;

        assert_eq!(report.final_count, 12);
        assert_eq!(report.reason, StopReason::Stalled);
        assert_eq!(session.triggers(), report.iterations as usize);
    }

    #[tokio::test]
    async fn test_unmoved_viewport_falls_back_to_wheel_script() {
        let session = MemorySession::new(feed(10))
            .with_lazy_rendering(5, 5)
            .with_pinned_viewport();
        let report = PageExpander::new(fast_config())
            .expand(&session, "div", &Cancellation::new())
            .await;

        assert_eq!(report.final_count, 10);
        assert_eq!(report.iterations, 4);
    }

    #[tokio::test]
    async fn test_cancellation_stops_before_first_iteration() {
        let session = MemorySession::new(feed(10)).with_lazy_rendering(2, 2);
        let cancel = Cancellation::new();
        cancel.cancel();

        let report = PageExpander::new(fast_config())
            .expand(&session, "div", &cancel)
            .await;

        assert_eq!(report.reason, StopReason::Cancelled);
        assert_eq!(report.iterations, 0);
        assert_eq!(report.state, ExpansionState::Expanding);
        assert_eq!(session.triggers(), 0);
    }
}
