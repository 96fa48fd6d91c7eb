//! Property-based tests for marker-based execution.

use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use tokio::time::Instant;

use rexec_core::CommandId;
use rexec_session::{
    CommandExecution, CompletionReason, MarkerPair, RunOutcome, RunnerCallbacks, RunnerConfig,
};

#[derive(Clone, Default)]
struct Recorded {
    lines: Arc<Mutex<Vec<String>>>,
    completed: Arc<Mutex<Vec<RunOutcome>>>,
}

impl Recorded {
    fn callbacks(&self) -> RunnerCallbacks {
        let lines = Arc::clone(&self.lines);
        let completed = Arc::clone(&self.completed);
        RunnerCallbacks::new()
            .on_line(move |line| lines.lock().unwrap().push(line.to_string()))
            .on_completed(move |outcome| completed.lock().unwrap().push(outcome.clone()))
    }
}

fn execution(markers: &MarkerPair, recorded: &Recorded, now: Instant) -> CommandExecution {
    CommandExecution::with_markers(
        CommandId::new(),
        "./deploy.sh",
        markers.clone(),
        None,
        &RunnerConfig::default(),
        recorded.callbacks(),
        now,
    )
    .unwrap()
}

fn reason() -> impl Strategy<Value = CompletionReason> {
    prop_oneof![
        Just(CompletionReason::EndMarker),
        Just(CompletionReason::Timeout),
        Just(CompletionReason::StreamClosed),
        Just(CompletionReason::Terminated),
        Just(CompletionReason::WriteFailed),
    ]
}

proptest! {
    /// Every exit status a shell can report is carried through.
    #[test]
    fn exit_status_is_reported(code in 0i32..=255) {
        let now = Instant::now();
        let markers = MarkerPair::generate("__REXEC");
        let recorded = Recorded::default();
        let mut exec = execution(&markers, &recorded, now);

        let stream = format!("{}\r\nwork\r\n{}:{}\r\n", markers.start(), markers.end(), code);
        let outcome = exec.on_data(stream.as_bytes(), now).unwrap();
        prop_assert!(outcome.completed);
        prop_assert_eq!(outcome.exit_code, code);
        prop_assert_eq!(exec.exit_code(), code);
    }

    /// Output lines survive arbitrary chunking, in order.
    #[test]
    fn lines_survive_chunking(
        lines in prop::collection::vec("[a-z0-9./_-]{1,30}", 0..12),
        split in any::<prop::sample::Index>(),
    ) {
        let now = Instant::now();
        let markers = MarkerPair::generate("__REXEC");
        let recorded = Recorded::default();
        let mut exec = execution(&markers, &recorded, now);

        let mut stream = format!("{}\n", markers.start());
        for line in &lines {
            stream.push_str(line);
            stream.push('\n');
        }
        stream.push_str(&format!("{}:0\n", markers.end()));

        let at = split.index(stream.len() + 1);
        let (head, tail) = stream.as_bytes().split_at(at);
        let first = exec.on_data(head, now);
        let outcome = first.or_else(|| exec.on_data(tail, now));

        prop_assert!(outcome.is_some());
        prop_assert_eq!(&*recorded.lines.lock().unwrap(), &lines);
    }

    /// Whatever ends an execution first wins; later completions are ignored.
    #[test]
    fn completion_happens_once(first in reason(), later in prop::collection::vec(reason(), 1..5)) {
        let now = Instant::now();
        let markers = MarkerPair::generate("__REXEC");
        let recorded = Recorded::default();
        let mut exec = execution(&markers, &recorded, now);

        let outcome = exec.complete(first).unwrap();
        prop_assert_eq!(outcome.reason, first);
        prop_assert_eq!(outcome.completed, first == CompletionReason::EndMarker);
        for reason in later {
            prop_assert!(exec.complete(reason).is_none());
        }
        prop_assert_eq!(recorded.completed.lock().unwrap().len(), 1);
        prop_assert_eq!(exec.outcome(), Some(&outcome));
    }
}
