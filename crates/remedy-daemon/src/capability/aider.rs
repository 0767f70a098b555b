//! The aider CLI as the code-modification tool.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use remedy_core::config::ToolConfig;
use tracing::info;

use super::{CodeModifier, Directive, DirectiveIo};
use crate::subprocess::{CommandSpec, LaunchError, ProcessSupervisor, SupervisorOutcome};

/// Runs `aider` non-interactively under the process supervisor.
///
/// Auto-commits are always off: the fix workflow inspects the diff and
/// commits on its own terms.
#[derive(Debug, Clone)]
pub struct AiderTool {
    binary: PathBuf,
    model: Option<String>,
    extra_args: Vec<String>,
}

impl AiderTool {
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            model: config.model.clone(),
            extra_args: config.extra_args.clone(),
        }
    }

    /// The command line for `directive` in `workdir`.
    pub fn command(&self, workdir: &Path, directive: &Directive) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.binary, workdir).arg("--yes");
        if let Some(model) = &self.model {
            spec = spec.args(["--model", model.as_str()]);
        }
        spec.arg("--no-auto-commits")
            .args(self.extra_args.iter().map(String::as_str))
            .arg("--message")
            .arg(directive.message())
            .env("NO_COLOR", "1")
    }
}

#[async_trait]
impl CodeModifier for AiderTool {
    async fn run_directive(
        &self,
        workdir: &Path,
        directive: &Directive,
        io: DirectiveIo,
    ) -> Result<SupervisorOutcome, LaunchError> {
        let spec = self.command(workdir, directive);
        info!(
            workdir = %workdir.display(),
            model = self.model.as_deref().unwrap_or("default"),
            directive = match directive {
                Directive::Review => "review",
                Directive::FixIssue { .. } => "fix_issue",
            },
            "Running aider"
        );
        ProcessSupervisor::run(spec, io.limits, io.output, io.cancel).await
    }
}
