//! Progress notifications emitted while sampling.
//!
//! The sampler reports one [`ProgressObserver::step`] per denoising step and
//! the transformer one [`ProgressObserver::substep`] per block. Observers are
//! called synchronously on the generating thread and cannot influence the
//! computation.

use std::fmt;

/// Which part of the transformer just finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    DoubleBlock,
    SingleBlock,
    FinalLayer,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::DoubleBlock => "double_block",
            Phase::SingleBlock => "single_block",
            Phase::FinalLayer => "final_layer",
        };
        f.write_str(name)
    }
}

pub trait ProgressObserver {
    /// Called before step `step` (1-based) of `total` runs.
    fn step(&mut self, step: usize, total: usize);

    /// Called after block `index` (0-based) of `total` blocks in `phase`.
    fn substep(&mut self, _phase: Phase, _index: usize, _total: usize) {}
}

/// Discards all notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn step(&mut self, _step: usize, _total: usize) {}
}

/// Reports progress as `tracing` events.
///
/// Steps are logged at info level. Blocks are logged at trace level using the
/// compact markers `d` (double block), `s` (every fifth single block) and `F`
/// (final layer).
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressObserver for TracingProgress {
    fn step(&mut self, step: usize, total: usize) {
        tracing::info!("Step {step}/{total}");
    }

    fn substep(&mut self, phase: Phase, index: usize, total: usize) {
        if let Some(marker) = TracingProgress::marker(phase, index) {
            tracing::trace!(%phase, index, total, "{marker}");
        }
    }
}

impl TracingProgress {
    /// Marker for a finished block, if that block is reported at all.
    pub fn marker(phase: Phase, index: usize) -> Option<&'static str> {
        match phase {
            Phase::DoubleBlock => Some("d"),
            Phase::SingleBlock if (index + 1) % 5 == 0 => Some("s"),
            Phase::SingleBlock => None,
            Phase::FinalLayer => Some("F"),
        }
    }
}

impl<F: FnMut(usize, usize)> ProgressObserver for F {
    fn step(&mut self, step: usize, total: usize) {
        self(step, total)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Event {
        Step(usize, usize),
        Substep(Phase, usize, usize),
    }

    /// Records every notification in order.
    #[derive(Debug, Default)]
    pub(crate) struct Recorder {
        pub events: Vec<Event>,
    }

    impl ProgressObserver for Recorder {
        fn step(&mut self, step: usize, total: usize) {
            self.events.push(Event::Step(step, total));
        }

        fn substep(&mut self, phase: Phase, index: usize, total: usize) {
            self.events.push(Event::Substep(phase, index, total));
        }
    }

    #[test]
    fn test_closure_observer() {
        let mut seen = Vec::new();
        {
            let mut observer = |i: usize, n: usize| seen.push((i, n));
            observer.step(1, 4);
            observer.substep(Phase::FinalLayer, 0, 1);
            observer.step(2, 4);
        }
        assert_eq!(seen, vec![(1, 4), (2, 4)]);
    }

    #[test]
    fn test_tracing_markers() {
        let markers: String = (0..5)
            .filter_map(|i| TracingProgress::marker(Phase::DoubleBlock, i))
            .chain((0..20).filter_map(|i| TracingProgress::marker(Phase::SingleBlock, i)))
            .chain(TracingProgress::marker(Phase::FinalLayer, 0))
            .collect();
        assert_eq!(markers, "dddddssssF");
        assert_eq!(TracingProgress::marker(Phase::SingleBlock, 3), None);
        assert_eq!(TracingProgress::marker(Phase::SingleBlock, 4), Some("s"));

        // Emitting through a subscriber does not disturb the observer.
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            let mut progress = TracingProgress;
            progress.step(1, 4);
            progress.substep(Phase::DoubleBlock, 0, 5);
            progress.substep(Phase::SingleBlock, 4, 20);
            progress.substep(Phase::FinalLayer, 0, 1);
        });
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::DoubleBlock.to_string(), "double_block");
        assert_eq!(Phase::SingleBlock.to_string(), "single_block");
        assert_eq!(Phase::FinalLayer.to_string(), "final_layer");
    }
}
