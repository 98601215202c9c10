/// Events emitted while a study is loaded and executed.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    PhaseStart { name: &'static str },
    PhaseFinish,

    /// A driver started a batch of `total_steps` evaluations (0 when unknown).
    TaskStart { total_steps: u64 },
    TaskIncrement,
    TaskFinish,

    /// One sweep of a coupled-system solver.
    MdaIteration {
        cycle: String,
        iteration: usize,
        residual: f64,
    },

    Message(String),
}

pub type ProgressCallback<'a> = Box<dyn Fn(Progress) + Send + Sync + 'a>;

/// Forwards engine events to an optional caller-supplied sink.
#[derive(Default)]
pub struct ProgressReporter<'a> {
    sink: Option<ProgressCallback<'a>>,
}

impl<'a> ProgressReporter<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback(callback: ProgressCallback<'a>) -> Self {
        Self {
            sink: Some(callback),
        }
    }

    #[inline]
    pub fn report(&self, event: Progress) {
        if let Some(sink) = &self.sink {
            sink(event);
        }
    }

    pub(crate) fn mda_iteration(&self, cycle: &str, iteration: usize, residual: f64) {
        if self.sink.is_some() {
            self.report(Progress::MdaIteration {
                cycle: cycle.to_string(),
                iteration,
                residual,
            });
        }
    }

    /// Runs `f` between a `PhaseStart` and a `PhaseFinish` event.
    pub fn phase<T>(&self, name: &'static str, f: impl FnOnce() -> T) -> T {
        self.report(Progress::PhaseStart { name });
        let result = f();
        self.report(Progress::PhaseFinish);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn phase_wraps_work_in_start_and_finish_events() {
        let events = Mutex::new(Vec::new());
        let reporter = ProgressReporter::with_callback(Box::new(|e| {
            events.lock().unwrap().push(e);
        }));

        let value = reporter.phase("Configure", || 7);

        assert_eq!(value, 7);
        drop(reporter);
        assert_eq!(
            events.into_inner().unwrap(),
            vec![
                Progress::PhaseStart { name: "Configure" },
                Progress::PhaseFinish
            ]
        );
    }

    #[test]
    fn mda_iterations_carry_the_cycle_name() {
        let events = Mutex::new(Vec::new());
        let reporter = ProgressReporter::with_callback(Box::new(|e| {
            events.lock().unwrap().push(e);
        }));

        reporter.mda_iteration("study.cycle", 3, 0.5);
        drop(reporter);

        assert_eq!(
            events.into_inner().unwrap(),
            vec![Progress::MdaIteration {
                cycle: "study.cycle".into(),
                iteration: 3,
                residual: 0.5,
            }]
        );
    }

    #[test]
    fn reporter_without_callback_is_silent() {
        let reporter = ProgressReporter::new();
        reporter.report(Progress::Message("ignored".into()));
        reporter.mda_iteration("cycle", 1, 1.0);
    }
}
