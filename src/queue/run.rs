use crate::encoder::CommandStage;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Completed,
    Failed,
    Canceled,
}

#[derive(Debug, Clone)]
struct StageFiles {
    input: PathBuf,
    output: PathBuf,
    cleanup_input: bool,
}

/// File bookkeeping for one pass through a job's stages.
///
/// Tracks which stage is current and which intermediates may be deleted. Inputs of
/// `cleanup_on_success` stages are only handed out once the final stage succeeded,
/// and at most once.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    stages: Vec<StageFiles>,
    current: usize,
    keep_output: bool,
    pending_deletion: Vec<PathBuf>,
    state: RunState,
}

impl PipelineRun {
    pub fn new(stages: &[CommandStage]) -> Self {
        Self {
            stages: stages
                .iter()
                .map(|s| StageFiles {
                    input: s.source.clone(),
                    output: s.output.clone(),
                    cleanup_input: s.cleanup_on_success,
                })
                .collect(),
            current: 0,
            keep_output: false,
            pending_deletion: Vec::new(),
            state: if stages.is_empty() {
                RunState::Completed
            } else {
                RunState::Running
            },
        }
    }

    /// Index of the stage to run next, `None` once the run is over
    pub fn current_stage(&self) -> Option<usize> {
        (self.state == RunState::Running).then_some(self.current)
    }

    /// Record whether the current stage's output must survive an abort.
    ///
    /// True only for a file the transcoder was told not to overwrite.
    pub fn begin_stage(&mut self, keep_output: bool) {
        self.keep_output = keep_output;
    }

    /// Mark the current stage successful; returns files that are now safe to delete
    pub fn complete_stage(&mut self) -> Vec<PathBuf> {
        let Some(index) = self.current_stage() else {
            return Vec::new();
        };
        let stage = &self.stages[index];
        if stage.cleanup_input {
            self.pending_deletion.push(stage.input.clone());
        }

        self.current += 1;
        if self.current < self.stages.len() {
            return Vec::new();
        }
        self.state = RunState::Completed;
        std::mem::take(&mut self.pending_deletion)
    }

    /// Stop after a failed stage; returns the partial output to remove, if any
    pub fn fail(&mut self) -> Option<PathBuf> {
        self.abort(RunState::Failed)
    }

    /// Stop after cancellation; returns the partial output to remove, if any
    pub fn cancel(&mut self) -> Option<PathBuf> {
        self.abort(RunState::Canceled)
    }

    fn abort(&mut self, state: RunState) -> Option<PathBuf> {
        let index = self.current_stage()?;
        self.state = state;
        // Inputs stay put: the job may be retried from them
        self.pending_deletion.clear();
        let stage = &self.stages[index];
        (!self.keep_output).then(|| stage.output.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::ProcessingParams;

    fn stage(source: &str, output: &str, cleanup: bool) -> CommandStage {
        CommandStage {
            name: "test".into(),
            source: source.into(),
            output: output.into(),
            params: ProcessingParams::default(),
            lut_path: None,
            cleanup_on_success: cleanup,
            notes: Vec::new(),
            probe_source: cleanup,
        }
    }

    fn pro() -> Vec<CommandStage> {
        vec![
            stage("src.mov", "master.mov", false),
            stage("master.mov", "out.mp4", true),
        ]
    }

    #[test]
    fn intermediate_released_after_final_stage_only() {
        let mut run = PipelineRun::new(&pro());
        assert_eq!(run.current_stage(), Some(0));
        assert!(run.complete_stage().is_empty());
        assert_eq!(run.current_stage(), Some(1));
        assert_eq!(run.complete_stage(), vec![PathBuf::from("master.mov")]);
        assert_eq!(run.current_stage(), None);
        // nothing left to hand out
        assert!(run.complete_stage().is_empty());
        assert_eq!(run.cancel(), None);
    }

    #[test]
    fn cancel_in_first_stage_removes_partial_master() {
        let mut run = PipelineRun::new(&pro());
        run.begin_stage(false);
        assert_eq!(run.cancel(), Some(PathBuf::from("master.mov")));
        assert_eq!(run.current_stage(), None);
        assert_eq!(run.fail(), None);
        assert!(run.complete_stage().is_empty());
        assert_eq!(run.cancel(), None);
    }

    #[test]
    fn failure_in_second_stage_keeps_master() {
        let mut run = PipelineRun::new(&pro());
        run.complete_stage();
        run.begin_stage(false);
        assert_eq!(run.fail(), Some(PathBuf::from("out.mp4")));
        assert!(run.complete_stage().is_empty());
    }

    #[test]
    fn protected_output_is_never_removed() {
        let mut run = PipelineRun::new(&[stage("a.mov", "b.mp4", false)]);
        run.begin_stage(true);
        assert_eq!(run.fail(), None);
    }

    #[test]
    fn single_stage_has_nothing_to_clean() {
        let mut run = PipelineRun::new(&[stage("a.mov", "b.mp4", false)]);
        assert!(run.complete_stage().is_empty());
        assert_eq!(run.current_stage(), None);
    }
}
