//! Logging context passed explicitly to the optimization entry points.

/// Receiver of human-readable progress and summary lines.
pub trait InfoSink: Send + Sync {
    fn info(&self, message: &str);
}

/// Forwards every line to the `log` facade at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl InfoSink for LogSink {
    fn info(&self, message: &str) {
        log::info!(target: "diversifier", "{message}");
    }
}

/// Discards everything; disables logging for a run.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl InfoSink for NoopSink {
    fn info(&self, _message: &str) {}
}

/// Summary statistics of the best `n` fitness values.
pub(crate) fn summary_line(sorted_ys: &[f64], elapsed_secs: f64) -> String {
    let finite: Vec<f64> = sorted_ys.iter().copied().filter(|y| y.is_finite()).collect();
    if finite.is_empty() {
        return format!("no occupied niches time {elapsed_secs:.2} s");
    }
    let n = finite.len() as f64;
    let mean = finite.iter().sum::<f64>() / n;
    let var = finite.iter().map(|y| (y - mean).powi(2)).sum::<f64>() / n;
    format!(
        "best {:.3} worst {:.3} mean {:.3} stdev {:.3} time {:.2} s",
        finite[0],
        finite[finite.len() - 1],
        mean,
        var.sqrt(),
        elapsed_secs
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Sink that keeps every line, for assertions.
    #[derive(Default)]
    pub(crate) struct CollectSink {
        pub(crate) lines: Mutex<Vec<String>>,
    }

    impl InfoSink for CollectSink {
        fn info(&self, message: &str) {
            self.lines.lock().push(message.to_string());
        }
    }

    #[test]
    fn test_summary_line() {
        let line = summary_line(&[1.0, 2.0, 3.0, f64::INFINITY], 0.5);
        assert!(line.starts_with("best 1.000 worst 3.000 mean 2.000"));
        assert!(summary_line(&[f64::INFINITY], 0.0).starts_with("no occupied"));
    }

    #[test]
    fn test_sinks() {
        let sink = CollectSink::default();
        sink.info("hello");
        NoopSink.info("dropped");
        LogSink.info("to the log facade");
        assert_eq!(sink.lines.lock().as_slice(), ["hello".to_string()]);
    }
}
