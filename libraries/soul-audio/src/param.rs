//! Automatable parameters
//!
//! An [`AudioParam`] is the control-side handle of a value that the renderer
//! evaluates once per frame. Changes are scheduled on a timeline against the
//! context clock, so the render thread never observes a half-applied update.
//! The handle keeps a mirror of the timeline so the current value can be read
//! without touching the render thread.
//!
//! The rendered value is the timeline value plus the sum of every node output
//! connected to the param, clamped to the param's nominal range.

use crate::context::ContextShared;
use crate::render::{Command, ParamOp};
use std::sync::{Arc, Mutex, PoisonError};

pub(crate) type ParamId = usize;

/// A scheduled change on a parameter timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum AutomationEvent {
    /// Jump to `value` at `time`
    SetValue { value: f32, time: f64 },
    /// Linear ramp from the previous event, reaching `value` at `time`
    LinearRamp { value: f32, time: f64 },
}

impl AutomationEvent {
    fn time(&self) -> f64 {
        match *self {
            Self::SetValue { time, .. } | Self::LinearRamp { time, .. } => time,
        }
    }
}

/// Ordered automation events plus the value in effect before the first one
#[derive(Debug, Clone)]
pub(crate) struct Timeline {
    initial: f32,
    events: Vec<AutomationEvent>,
}

impl Timeline {
    pub(crate) fn new(initial: f32) -> Self {
        Self {
            initial,
            events: Vec::new(),
        }
    }

    pub(crate) fn apply(&mut self, op: ParamOp) {
        match op {
            ParamOp::Insert(event) => self.insert(event),
            ParamOp::CancelFrom(time) => self.cancel_from(time),
        }
    }

    /// Insert keeping time order; events at equal times keep insertion order
    pub(crate) fn insert(&mut self, event: AutomationEvent) {
        let t = event.time();
        let pos = self.events.partition_point(|e| e.time() <= t);
        self.events.insert(pos, event);
    }

    /// Drop every event scheduled at or after `time`
    pub(crate) fn cancel_from(&mut self, time: f64) {
        self.events.retain(|e| e.time() < time);
    }

    pub(crate) fn value_at(&self, t: f64) -> f32 {
        let mut prev_value = self.initial;
        let mut prev_time = f64::NEG_INFINITY;

        for event in &self.events {
            match *event {
                AutomationEvent::SetValue { value, time } => {
                    if t < time {
                        return prev_value;
                    }
                    prev_value = value;
                    prev_time = time;
                }
                AutomationEvent::LinearRamp { value, time } => {
                    if t < time {
                        if !prev_time.is_finite() || time <= prev_time {
                            return prev_value;
                        }
                        let frac = ((t - prev_time) / (time - prev_time)).clamp(0.0, 1.0);
                        return prev_value + (value - prev_value) * frac as f32;
                    }
                    prev_value = value;
                    prev_time = time;
                }
            }
        }

        prev_value
    }

    /// True when nothing changes after `t`
    fn is_settled_at(&self, t: f64) -> bool {
        self.events.last().map_or(true, |e| e.time() <= t)
    }

    /// Per-frame values starting at `start`, `dt` seconds apart
    pub(crate) fn fill(&self, start: f64, dt: f64, out: &mut [f32]) {
        if self.is_settled_at(start) {
            out.fill(self.value_at(start));
            return;
        }
        for (n, v) in out.iter_mut().enumerate() {
            *v = self.value_at(start + dt * n as f64);
        }
    }

    /// Collapse events that lie entirely before `t`
    ///
    /// The value at `t` becomes an anchor so a ramp still in progress keeps
    /// interpolating along the same line, and a ramp scheduled later starts
    /// from `t` rather than jumping at its end.
    pub(crate) fn prune(&mut self, t: f64) {
        let past = self.events.partition_point(|e| e.time() <= t);
        if past == 0 {
            return;
        }
        let value = self.value_at(t);
        self.initial = value;
        self.events.drain(..past);
        self.events
            .insert(0, AutomationEvent::SetValue { value, time: t });
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }
}

/// Static description of a parameter, fixed at node creation
#[derive(Debug, Clone, Copy)]
pub(crate) struct ParamSpec {
    pub name: &'static str,
    pub default: f32,
    pub min: f32,
    pub max: f32,
}

impl ParamSpec {
    pub(crate) const fn new(name: &'static str, default: f32, min: f32, max: f32) -> Self {
        Self {
            name,
            default,
            min,
            max,
        }
    }

    /// Unbounded parameter
    pub(crate) const fn unbounded(name: &'static str, default: f32) -> Self {
        Self::new(name, default, f32::MIN, f32::MAX)
    }
}

struct ParamShared {
    id: ParamId,
    spec: ParamSpec,
    timeline: Mutex<Timeline>,
}

/// Control-side handle to an automatable parameter
#[derive(Clone)]
pub struct AudioParam {
    shared: Arc<ParamShared>,
    context: Arc<ContextShared>,
}

impl AudioParam {
    pub(crate) fn new(id: ParamId, spec: ParamSpec, context: Arc<ContextShared>) -> Self {
        Self {
            shared: Arc::new(ParamShared {
                id,
                spec,
                timeline: Mutex::new(Timeline::new(spec.default)),
            }),
            context,
        }
    }

    pub(crate) fn id(&self) -> ParamId {
        self.shared.id
    }

    pub(crate) fn context(&self) -> &Arc<ContextShared> {
        &self.context
    }

    pub fn name(&self) -> &'static str {
        self.shared.spec.name
    }

    pub fn default_value(&self) -> f32 {
        self.shared.spec.default
    }

    pub fn min_value(&self) -> f32 {
        self.shared.spec.min
    }

    pub fn max_value(&self) -> f32 {
        self.shared.spec.max
    }

    /// Scheduled value at the current context time
    ///
    /// Does not include signals connected to the parameter.
    pub fn value(&self) -> f32 {
        self.value_at(self.context.current_time())
    }

    /// Scheduled value at `time`
    pub fn value_at(&self, time: f64) -> f32 {
        let spec = self.shared.spec;
        self.timeline().value_at(time).clamp(spec.min, spec.max)
    }

    /// Set the value now
    pub fn set_value(&self, value: f32) {
        self.set_value_at_time(value, self.context.current_time());
    }

    pub fn set_value_at_time(&self, value: f32, time: f64) {
        self.schedule(ParamOp::Insert(AutomationEvent::SetValue { value, time }));
    }

    /// Ramp linearly from the previous event so that `value` is reached at `time`
    pub fn linear_ramp_to_value_at_time(&self, value: f32, time: f64) {
        self.schedule(ParamOp::Insert(AutomationEvent::LinearRamp { value, time }));
    }

    /// Remove every event scheduled at or after `time`
    pub fn cancel_scheduled_values(&self, time: f64) {
        self.schedule(ParamOp::CancelFrom(time));
    }

    /// Glide from the current value to `value` over `duration` seconds
    ///
    /// Pending automation is cancelled and the ramp is anchored at the value
    /// in effect right now, so it always starts where the listener is.
    pub fn ramp_to(&self, value: f32, duration: f64) {
        let now = self.context.current_time();
        let current = self.value_at(now);
        self.cancel_scheduled_values(now);
        self.set_value_at_time(current, now);
        if duration > 0.0 {
            self.linear_ramp_to_value_at_time(value, now + duration);
        } else {
            self.set_value_at_time(value, now);
        }
    }

    fn timeline(&self) -> std::sync::MutexGuard<'_, Timeline> {
        self.shared
            .timeline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule(&self, op: ParamOp) {
        {
            let mut timeline = self.timeline();
            timeline.apply(op);
            timeline.prune(self.context.current_time());
        }
        self.context.send(Command::Param {
            id: self.shared.id,
            op,
        });
    }
}

impl std::fmt::Debug for AudioParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioParam")
            .field("name", &self.shared.spec.name)
            .field("id", &self.shared.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_events_yields_initial() {
        let t = Timeline::new(0.3);
        assert_eq!(t.value_at(0.0), 0.3);
        assert_eq!(t.value_at(100.0), 0.3);
    }

    #[test]
    fn set_value_takes_effect_at_its_time() {
        let mut t = Timeline::new(0.0);
        t.insert(AutomationEvent::SetValue {
            value: 1.0,
            time: 2.0,
        });
        assert_eq!(t.value_at(1.999), 0.0);
        assert_eq!(t.value_at(2.0), 1.0);
    }

    #[test]
    fn linear_ramp_interpolates_from_previous_event() {
        let mut t = Timeline::new(0.0);
        t.insert(AutomationEvent::SetValue {
            value: 0.0,
            time: 1.0,
        });
        t.insert(AutomationEvent::LinearRamp {
            value: 1.0,
            time: 2.0,
        });

        assert!((t.value_at(1.5) - 0.5).abs() < 1e-6);
        assert_eq!(t.value_at(2.0), 1.0);
        assert_eq!(t.value_at(3.0), 1.0);
    }

    #[test]
    fn cancel_removes_future_events() {
        let mut t = Timeline::new(0.0);
        t.insert(AutomationEvent::SetValue {
            value: 1.0,
            time: 1.0,
        });
        t.insert(AutomationEvent::SetValue {
            value: 2.0,
            time: 2.0,
        });
        t.cancel_from(1.5);

        assert_eq!(t.value_at(5.0), 1.0);
    }

    #[test]
    fn prune_keeps_ramp_in_progress() {
        let mut t = Timeline::new(0.0);
        t.insert(AutomationEvent::SetValue {
            value: 0.0,
            time: 0.0,
        });
        t.insert(AutomationEvent::LinearRamp {
            value: 1.0,
            time: 1.0,
        });
        let before = t.value_at(0.75);
        t.prune(0.5);

        assert!((t.value_at(0.75) - before).abs() < 1e-6);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn prune_collapses_settled_timeline() {
        let mut t = Timeline::new(0.0);
        t.insert(AutomationEvent::SetValue {
            value: 0.7,
            time: 0.1,
        });
        t.insert(AutomationEvent::SetValue {
            value: 0.2,
            time: 0.3,
        });
        t.prune(1.0);

        assert_eq!(t.len(), 1);
        assert_eq!(t.value_at(2.0), 0.2);
    }

    #[test]
    fn ramp_after_settled_prune_starts_at_anchor() {
        let mut t = Timeline::new(1.0);
        t.insert(AutomationEvent::SetValue {
            value: 0.4,
            time: 0.5,
        });
        t.prune(0.5);
        t.insert(AutomationEvent::LinearRamp {
            value: 0.0,
            time: 1.5,
        });

        assert_eq!(t.value_at(0.5), 0.4);
        assert!((t.value_at(1.0) - 0.2).abs() < 1e-6);
        assert_eq!(t.value_at(1.5), 0.0);
    }

    #[test]
    fn fill_matches_pointwise_evaluation() {
        let mut t = Timeline::new(0.0);
        t.insert(AutomationEvent::SetValue {
            value: 0.0,
            time: 0.0,
        });
        t.insert(AutomationEvent::LinearRamp {
            value: 1.0,
            time: 0.01,
        });
        let mut out = [0.0f32; 16];
        t.fill(0.0, 0.001, &mut out);

        for (n, v) in out.iter().enumerate() {
            assert!((v - t.value_at(n as f64 * 0.001)).abs() < 1e-6);
        }
    }
}
