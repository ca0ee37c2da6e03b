use serde::{Deserialize, Serialize};

/// Classification of one remote command execution.
///
/// `Running` is the only non-terminal state; a step that has not started yet
/// is represented by `None` on its owner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    Running,
    Success,
    Fail,
    Complete,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Classify a finished command. The expect marker upgrades `Complete` to
/// `Success`; the fail marker is checked last and always wins.
pub fn classify(
    stdout: &str,
    stderr: &str,
    expect: Option<&str>,
    fail: Option<&str>,
) -> StepState {
    let mut state = StepState::Complete;
    if let Some(marker) = expect.filter(|value| !value.is_empty()) {
        if stdout.contains(marker) {
            state = StepState::Success;
        }
    }
    if let Some(marker) = fail.filter(|value| !value.is_empty()) {
        if stdout.contains(marker) || stderr.contains(marker) {
            state = StepState::Fail;
        }
    }
    state
}

/// Captured output of one finished command and its classification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub stdout: String,
    pub stderr: String,
    pub state: StepState,
}

impl StepResult {
    pub fn from_output(
        stdout: String,
        stderr: String,
        expect: Option<&str>,
        fail: Option<&str>,
    ) -> Self {
        let state = classify(&stdout, &stderr, expect, fail);
        Self {
            stdout,
            stderr,
            state,
        }
    }
}

/// Wire shape of a step record kept in the progress log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StepSnapshot {
    pub id: String,
    pub action: String,
    pub output: String,
    pub error: String,
    pub state: Option<StepState>,
}

#[cfg(test)]
mod tests {
    use super::{classify, StepResult, StepState};

    #[test]
    fn no_markers_means_complete() {
        assert_eq!(classify("ok", "", None, None), StepState::Complete);
    }

    #[test]
    fn expect_marker_gives_success() {
        assert_eq!(
            classify("PONG\n", "", Some("PONG"), Some("ERR")),
            StepState::Success
        );
        assert_eq!(classify("nothing", "", Some("PONG"), None), StepState::Complete);
    }

    #[test]
    fn fail_marker_dominates_success() {
        assert_eq!(
            classify("PONG then ERR", "", Some("PONG"), Some("ERR")),
            StepState::Fail
        );
        assert_eq!(
            classify("PONG", "ERR connection refused", Some("PONG"), Some("ERR")),
            StepState::Fail
        );
    }

    #[test]
    fn empty_markers_are_ignored() {
        assert_eq!(classify("anything", "", Some(""), Some("")), StepState::Complete);
    }

    #[test]
    fn step_result_keeps_output() {
        let result = StepResult::from_output(
            "already installed".to_string(),
            "warning: apt does not have a stable CLI".to_string(),
            Some("already"),
            None,
        );
        assert_eq!(result.state, StepState::Success);
        assert_eq!(result.stdout, "already installed");
        assert!(result.stderr.starts_with("warning"));
    }

    #[test]
    fn only_running_is_not_terminal() {
        assert!(StepState::Success.is_terminal());
        assert!(StepState::Fail.is_terminal());
        assert!(StepState::Complete.is_terminal());
        assert!(!StepState::Running.is_terminal());
    }
}
