//! Spatializer position automation
//!
//! Moves the source on an orbit around the listener. A fixed-period tokio
//! interval drives it; each tick reads the audio clock, computes the next
//! point and ramps the panner there over one period, so motion stays smooth
//! between ticks. The store only hears about every few ticks.

use crate::appliers::{glide, set_panner_position};
use crate::config::AutomationSettings;
use crate::graph::EffectGraph;
use crate::params::Position;
use crate::store::ParameterStore;
use soul_audio::{AudioContext, ContextState};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Point on the orbit at audio time `t`
///
/// `x = sin(t·r)·R`, `y = sin(t·r/2)·R/2`, `z = cos(t·r)·R`.
pub fn orbit_position(t: f64, rate: f64, radius: f64) -> Position {
    let phase = t * rate;
    Position {
        x: phase.sin() * radius,
        y: (phase * 0.5).sin() * (radius / 2.0),
        z: phase.cos() * radius,
    }
}

struct Running {
    task: JoinHandle<()>,
    last: Arc<Mutex<Option<Position>>>,
}

/// Owns the automation timer of one session
pub struct AutomationDriver {
    ctx: AudioContext,
    graph: EffectGraph,
    store: ParameterStore,
    settings: AutomationSettings,
    running: Option<Running>,
}

impl std::fmt::Debug for AutomationDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutomationDriver")
            .field("running", &self.is_running())
            .field("interval_ms", &self.settings.interval_ms)
            .finish()
    }
}

impl AutomationDriver {
    pub fn new(
        ctx: AudioContext,
        graph: EffectGraph,
        store: ParameterStore,
        settings: AutomationSettings,
    ) -> Self {
        Self {
            ctx,
            graph,
            store,
            settings,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start the timer; false when it already runs
    pub fn start(&mut self) -> bool {
        if self.running.is_some() {
            return false;
        }

        let last = Arc::new(Mutex::new(None));
        let task = tokio::spawn(Self::run(
            self.ctx.clone(),
            self.graph.clone(),
            self.store.clone(),
            self.settings.clone(),
            Arc::clone(&last),
        ));
        self.running = Some(Running { task, last });
        info!(interval_ms = self.settings.interval_ms, "Position automation started");
        true
    }

    /// Stop the timer and hold the last computed position
    ///
    /// Scheduled ramps are cancelled; the panner and the store both keep
    /// the last point the orbit reached. Returns that point.
    pub async fn stop(&mut self) -> Option<Position> {
        let running = self.running.take()?;
        running.task.abort();
        let _ = running.task.await;

        let last = *running.last.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(position) = last {
            if self.ctx.state() != ContextState::Closed {
                set_panner_position(&self.graph, position, self.ctx.current_time());
            }
            self.store.update(|p| p.spatial.position = position);
        }
        info!(position = ?last, "Position automation stopped");
        last
    }

    async fn run(
        ctx: AudioContext,
        graph: EffectGraph,
        store: ParameterStore,
        settings: AutomationSettings,
        last: Arc<Mutex<Option<Position>>>,
    ) {
        let period = settings.interval();
        let ramp = period.as_secs_f64();
        let publish_every = settings.ui_update_every.max(1);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks: u32 = 0;

        loop {
            interval.tick().await;
            if ctx.state() != ContextState::Running {
                continue;
            }

            let now = ctx.current_time();
            let rate = store.read(|p| p.spatial.automation_rate);
            let position = orbit_position(now, rate, settings.radius);

            glide(graph.panner.position_x(), position.x, now, ramp);
            glide(graph.panner.position_y(), position.y, now, ramp);
            glide(graph.panner.position_z(), position.z, now, ramp);
            *last.lock().unwrap_or_else(PoisonError::into_inner) = Some(position);

            if ticks % publish_every == 0 {
                store.update(|p| p.spatial.position = position);
            }
            ticks = ticks.wrapping_add(1);
            debug!(time = now, x = position.x, z = position.z, "Automation tick");
        }
    }
}

impl Drop for AutomationDriver {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.task.abort();
        }
    }
}
