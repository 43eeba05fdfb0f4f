//! Mirror links to Google Drive through the download orchestrator.

use async_trait::async_trait;
use regex::Regex;
use std::fmt::Write as _;
use std::sync::{Arc, LazyLock};

use super::traits::Plugin;
use crate::commands::{Command, CommandContext, CommandOutput, PatternMatch, Usage};
use crate::download::{
    DownloadOrchestrator, NotifyError, ProgressPhase, ProgressRecord, StatusMessage,
    TransferNotifier, TransferOutcome, TransferSource,
};
use crate::platform::{ChatPlatform, MessageRef, PlatformError};
use crate::util::{format_duration, human_bytes};

static LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:https?|ftp)://\S+|magnet:\?\S+").unwrap());

/// `mirror`, `abort`, `pause`, `resume` and `transfers`.
pub struct MirrorPlugin {
    orchestrator: Arc<DownloadOrchestrator>,
}

impl MirrorPlugin {
    pub fn new(orchestrator: Arc<DownloadOrchestrator>) -> Self {
        Self { orchestrator }
    }

    async fn mirror(&self, ctx: CommandContext) -> anyhow::Result<CommandOutput> {
        let link = match &ctx.matches {
            PatternMatch::Matched(captures) => captures
                .first()
                .and_then(|c| c.get(0))
                .map(str::to_string),
            PatternMatch::NoMatch | PatternMatch::NotDeclared => None,
        };
        let Some(link) = link else {
            return Ok("__Give me a link or reply to one.__".into());
        };

        match self
            .orchestrator
            .schedule(TransferSource::Uri(link), ctx.message.message_ref())
            .await
        {
            Ok(gid) => Ok(format!("__Download queued__\nGID: `{gid}`").into()),
            Err(e) => Ok(e.to_string().into()),
        }
    }

    async fn abort(&self, ctx: CommandContext) -> anyhow::Result<CommandOutput> {
        let Some(gid) = ctx.args().first() else {
            return Ok("__Give me the GID to abort.__".into());
        };
        match self.orchestrator.cancel(gid).await {
            Ok(()) => Ok(format!("__Transmission aborted for__ `{gid}`").into()),
            Err(e) => Ok(e.to_string().into()),
        }
    }

    async fn pause(&self, ctx: CommandContext) -> anyhow::Result<CommandOutput> {
        let Some(gid) = ctx.args().first() else {
            return Ok("__Give me the GID to pause.__".into());
        };
        match self.orchestrator.pause(gid).await {
            Ok(()) => Ok(format!("__Paused__ `{gid}`").into()),
            Err(e) => Ok(e.to_string().into()),
        }
    }

    async fn resume(&self, ctx: CommandContext) -> anyhow::Result<CommandOutput> {
        let Some(gid) = ctx.args().first() else {
            return Ok("__Give me the GID to resume.__".into());
        };
        match self.orchestrator.resume(gid).await {
            Ok(()) => Ok(format!("__Resumed__ `{gid}`").into()),
            Err(e) => Ok(e.to_string().into()),
        }
    }

    async fn transfers(&self) -> CommandOutput {
        let records = self.orchestrator.status_snapshot().await;
        if records.is_empty() {
            "__No running transfers.__".into()
        } else {
            format_progress(&records).into()
        }
    }
}

impl Plugin for MirrorPlugin {
    fn name(&self) -> &str {
        "mirror"
    }

    fn commands(self: Arc<Self>) -> Vec<Command> {
        let plugin = Arc::clone(&self);
        let mirror = Command::builder("mirror")
            .alias("m")
            .description("Download a link and upload it to Google Drive")
            .usage(Usage::new("link").reply())
            .pattern(LINK.clone())
            .handler(move |ctx| {
                let plugin = Arc::clone(&plugin);
                async move { plugin.mirror(ctx).await }
            });

        let plugin = Arc::clone(&self);
        let abort = Command::builder("abort")
            .alias("cancel")
            .description("Abort a running transfer")
            .usage(Usage::new("gid"))
            .handler(move |ctx| {
                let plugin = Arc::clone(&plugin);
                async move { plugin.abort(ctx).await }
            });

        let plugin = Arc::clone(&self);
        let pause = Command::builder("pause")
            .description("Pause a download")
            .usage(Usage::new("gid"))
            .handler(move |ctx| {
                let plugin = Arc::clone(&plugin);
                async move { plugin.pause(ctx).await }
            });

        let plugin = Arc::clone(&self);
        let resume = Command::builder("resume")
            .description("Resume a paused download")
            .usage(Usage::new("gid"))
            .handler(move |ctx| {
                let plugin = Arc::clone(&plugin);
                async move { plugin.resume(ctx).await }
            });

        let plugin = self;
        let transfers = Command::builder("transfers")
            .alias("status")
            .description("Show the progress of every running transfer")
            .handler(move |_| {
                let plugin = Arc::clone(&plugin);
                async move { Ok(plugin.transfers().await) }
            });

        vec![mirror, abort, pause, resume, transfers]
    }
}

/// `●●●○` style bar with ten slots.
fn progress_bar(fraction: f64) -> String {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let filled = (fraction.clamp(0.0, 1.0) * 10.0).round() as usize;
    let mut bullets = "●".repeat(filled);
    if filled < 10 {
        bullets.push('○');
    }
    let used = filled + usize::from(filled < 10);
    bullets.push_str(&"    ".repeat(10 - used));
    bullets
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

/// Combined progress text for every record.
pub fn format_progress(records: &[ProgressRecord]) -> String {
    let mut text = String::new();
    for record in records {
        let _ = write!(text, "`{}`\nGID: `{}`\n", record.name, record.gid);
        if let ProgressPhase::ComputingFolder { done, total } = record.phase {
            let _ = write!(
                text,
                "__ComputingFolder: [{done}/{total}] {:.2}%__\n\n",
                record.percent()
            );
            continue;
        }

        let status = match record.phase {
            ProgressPhase::Uploading => "Uploading".to_string(),
            _ => capitalize(record.status.as_str()),
        };
        let percent = record.percent();
        let eta = record
            .eta
            .map_or_else(|| "-".to_string(), format_duration);
        let _ = write!(
            text,
            "Status: **{status}**\nProgress: [{}] {percent:.0}%\n__{} of {} @ {}/s\neta - {eta}__\n\n",
            progress_bar(percent / 100.0),
            human_bytes(record.completed),
            human_bytes(record.total),
            human_bytes(record.speed),
        );
    }
    text
}

/// Final reply for one transfer.
pub fn format_outcome(outcome: &TransferOutcome) -> String {
    match outcome {
        TransferOutcome::Uploaded {
            name,
            file,
            index_link,
        } => {
            let link = file.link.as_deref().unwrap_or_default();
            let mut text = format!(
                "**GoogleDrive Link**: [{name}]({link}) (__{}__)",
                human_bytes(file.size)
            );
            if let Some(index) = index_link {
                let _ = write!(text, "\n\n__IndexLink__: [Here]({index}).");
            }
            text
        }
        TransferOutcome::FolderUploaded {
            name,
            link,
            index_link,
        } => {
            let mut text = format!("**GoogleDrive folderLink**: [{name}]({link})");
            if let Some(index) = index_link {
                let _ = write!(text, "\n\n__IndexLink__: [Here]({index}).");
            }
            text
        }
        TransferOutcome::Failed {
            name,
            status,
            error_code,
            error_message,
        } => format!(
            "`{name}`\nStatus: **{}**\nError: __{error_message}__\nCode: **{}**",
            capitalize(status.as_str()),
            error_code.unwrap_or_default()
        ),
        TransferOutcome::UploadFailed { name, error } => {
            format!("`{name}`\nStatus: **Upload failed**\nError: __{error}__")
        }
        TransferOutcome::Aborted { name } => format!("`{name}`\n__Transmission aborted.__"),
    }
}

fn notify_error(e: PlatformError) -> NotifyError {
    match e {
        PlatformError::RateLimited(wait) => NotifyError::RateLimited(wait),
        PlatformError::NotModified => NotifyError::NotModified,
        other => NotifyError::Failed(other.to_string()),
    }
}

/// Reports orchestrator progress and outcomes as chat messages.
pub struct MirrorNotifier {
    platform: Arc<dyn ChatPlatform>,
}

impl MirrorNotifier {
    pub fn new(platform: Arc<dyn ChatPlatform>) -> Self {
        Self { platform }
    }

    async fn reply(&self, invoker: MessageRef, text: &str) -> Result<MessageRef, NotifyError> {
        self.platform
            .send_message(invoker.chat_id, text, Some(invoker.message_id))
            .await
            .map_err(notify_error)
    }
}

#[async_trait]
impl TransferNotifier for MirrorNotifier {
    async fn report_progress(
        &self,
        status: &StatusMessage,
        records: &[ProgressRecord],
    ) -> Result<MessageRef, NotifyError> {
        let text = format_progress(records);
        if let Some(target) = status.progress {
            match self.platform.edit_message(target, &text).await {
                Ok(()) => return Ok(target),
                Err(PlatformError::NotFound) => {}
                Err(e) => return Err(notify_error(e)),
            }
        }
        self.reply(status.invoker, &text).await
    }

    async fn report_outcome(
        &self,
        invoker: MessageRef,
        outcome: &TransferOutcome,
    ) -> Result<(), NotifyError> {
        self.reply(invoker, &format_outcome(outcome)).await.map(drop)
    }

    async fn release(&self, status: &StatusMessage) -> Result<(), NotifyError> {
        let Some(target) = status.progress else {
            return Ok(());
        };
        match self.platform.delete_message(target).await {
            Ok(()) | Err(PlatformError::NotFound) => Ok(()),
            Err(e) => Err(notify_error(e)),
        }
    }
}
