//! Job runner: one job at a time, with an explicit busy policy.
//!
//! ```text
//! submit ─► idle?  ─yes─► JobStart ─► run ─► JobDone ─► receipt ─► next queued / idle
//!             │no
//!             ├─ reject ─► receipt 409
//!             └─ queue  ─► runs after the current job
//! ```
//!
//! With auto-shutdown the runner closes after its first job and asks the
//! process to stop. Anything still queued, or submitted afterwards, gets a
//! 503 receipt instead of being dropped.

use chrono::Utc;
use ntcb_core::bus::{publish_json, Handler, Inbound};
use ntcb_core::config::BusyPolicy;
use ntcb_core::lifecycle::ComponentContext;
use ntcb_core::messages::{BotCommand, BotCommandKey, BotCommandReceipt, BotJobNotice};
use ntcb_core::topics;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::job::Job;

pub const AUTORUN_COMMAND_ID: &str = "autorun";

pub mod codes {
    pub const STARTED: i32 = 100;
    pub const DONE: i32 = 200;
    pub const BUSY: i32 = 409;
    pub const FAILED: i32 = 500;
    pub const SHUTTING_DOWN: i32 = 503;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub command_id: String,
    pub arguments: String,
    /// Auto-run requests have no originator to answer.
    pub wants_receipt: bool,
}

impl JobRequest {
    pub fn from_command(cmd: &BotCommand) -> Self {
        Self { command_id: cmd.command_id.clone(), arguments: cmd.job_arguments.clone(), wants_receipt: true }
    }

    pub fn autorun() -> Self {
        Self { command_id: AUTORUN_COMMAND_ID.into(), arguments: String::new(), wants_receipt: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Started,
    Queued,
    Rejected,
    Closed,
}

#[derive(Default)]
struct RunnerState {
    running: bool,
    closed: bool,
    queue: VecDeque<JobRequest>,
}

pub struct JobRunner {
    ctx: ComponentContext,
    job: Arc<dyn Job>,
    policy: BusyPolicy,
    auto_shutdown: bool,
    state: Mutex<RunnerState>,
}

impl JobRunner {
    pub fn new(ctx: ComponentContext, job: Arc<dyn Job>, policy: BusyPolicy, auto_shutdown: bool) -> Arc<Self> {
        Arc::new(Self { ctx, job, policy, auto_shutdown, state: Mutex::new(RunnerState::default()) })
    }

    /// Never blocks: the job and any receipt are published from the
    /// context's worker pool.
    pub fn submit(self: &Arc<Self>, req: JobRequest) -> Submission {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                Submission::Closed
            } else if !state.running {
                state.running = true;
                Submission::Started
            } else {
                match self.policy {
                    BusyPolicy::Reject => Submission::Rejected,
                    BusyPolicy::Queue => {
                        state.queue.push_back(req.clone());
                        Submission::Queued
                    }
                }
            }
        };

        match outcome {
            Submission::Started => {
                let runner = self.clone();
                self.ctx.tasks.spawn(async move { runner.drive(req).await });
            }
            Submission::Queued => info!("job {} queued behind the running job", req.command_id),
            Submission::Rejected => {
                info!("job {} rejected: a job is already running", req.command_id);
                self.answer_later(req, codes::BUSY, "job already running");
            }
            Submission::Closed => {
                info!("job {} refused: bot is shutting down", req.command_id);
                self.answer_later(req, codes::SHUTTING_DOWN, "bot is shutting down");
            }
        }
        outcome
    }

    #[cfg(test)]
    pub fn is_busy(&self) -> bool {
        self.state.lock().running
    }

    async fn drive(self: Arc<Self>, first: JobRequest) {
        let mut next = Some(first);
        while let Some(req) = next.take() {
            self.run_one(req).await;

            let (closed, leftovers): (bool, Vec<JobRequest>) = {
                let mut state = self.state.lock();
                if self.auto_shutdown || self.ctx.shutdown.is_cancelled() {
                    state.running = false;
                    state.closed = true;
                    (true, state.queue.drain(..).collect())
                } else {
                    next = state.queue.pop_front();
                    state.running = next.is_some();
                    (false, Vec::new())
                }
            };

            if closed {
                for req in leftovers {
                    self.answer(&req, codes::SHUTTING_DOWN, "bot is shutting down").await;
                }
                if self.auto_shutdown {
                    info!("auto-shutdown: first job finished, stopping bot");
                    self.ctx.request_shutdown();
                }
            }
        }
    }

    async fn run_one(&self, req: JobRequest) {
        let name = self.job.name().to_string();
        self.notice(&topics::bot_job_start(self.ctx.snow_id()), &req, codes::STARTED, "job started").await;
        self.ctx.log("job", format!("job {name} ({}) started", req.command_id)).await;

        let cancel = self.ctx.shutdown.child_token();
        let (code, message) = match self.job.run(&self.ctx, &req.arguments, cancel).await {
            Ok(msg) => (codes::DONE, msg),
            Err(e) => {
                error!("job {name} ({}) failed: {e}", req.command_id);
                (codes::FAILED, format!("job failed: {e}"))
            }
        };

        self.notice(&topics::bot_job_done(self.ctx.snow_id()), &req, code, &message).await;
        self.ctx.log("job", format!("job {name} ({}) finished with {code}", req.command_id)).await;
        self.answer(&req, code, &message).await;
    }

    async fn notice(&self, topic: &str, req: &JobRequest, code: i32, message: &str) {
        let notice = BotJobNotice {
            component_id: self.ctx.header.component_id.clone(),
            snow_id: self.ctx.snow_id(),
            command_id: req.command_id.clone(),
            job_name: self.job.name().to_string(),
            notice_time: Utc::now(),
            code,
            message: message.to_string(),
        };
        if let Err(e) = publish_json(self.ctx.publisher.as_ref(), topic, &notice).await {
            warn!("notice on {topic} not delivered: {e}");
        }
    }

    async fn answer(&self, req: &JobRequest, code: i32, message: &str) {
        if !req.wants_receipt {
            return;
        }
        let receipt = BotCommandReceipt::new(&req.command_id, self.ctx.snow_id(), code, message);
        if let Err(e) = publish_json(self.ctx.publisher.as_ref(), &topics::bot_receipt(self.ctx.snow_id()), &receipt).await {
            warn!("receipt for command {} not delivered: {e}", req.command_id);
        }
    }

    fn answer_later(self: &Arc<Self>, req: JobRequest, code: i32, message: &'static str) {
        let runner = self.clone();
        self.ctx.tasks.spawn(async move { runner.answer(&req, code, message).await });
    }
}

/// Handler for the bot's private command topic.
pub fn command_route(runner: Arc<JobRunner>) -> (String, Handler) {
    let own = runner.ctx.snow_id();
    let handler: Handler = Arc::new(move |msg: Inbound| {
        let cmd = match msg.json::<BotCommand>() {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("undecodable bot command on {}: {e}", msg.topic);
                return;
            }
        };
        if cmd.bot_snow_id != 0 && cmd.bot_snow_id != own {
            debug!("command {} addressed to bot {}, ignored", cmd.command_id, cmd.bot_snow_id);
            return;
        }
        match &cmd.command_key {
            BotCommandKey::StartJob => {
                runner.submit(JobRequest::from_command(&cmd));
            }
            BotCommandKey::Unknown(key) => warn!("unknown bot command key '{key}' in command {}", cmd.command_id),
        }
    });
    (topics::bot(own), handler)
}
