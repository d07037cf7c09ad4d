use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::events::{ControlMsg, FileEvent, Mailbox, MinerEvent, Msg};
use crate::extract::ExtractorRegistry;
use crate::miner::MinerFs;
use crate::notifier::FileNotifier;
use crate::tree::{IndexingTree, TreeEvent};
use crate::SharedState;

const IDLE_WAIT: Duration = Duration::from_millis(500);

/// The single event-loop thread owning the whole pipeline. Control
/// messages, monitor events and flush completions arrive through the
/// mailbox; reconcile work and queue dispatch run cooperatively, one
/// batch per iteration, so live events always reach the queue before
/// stale ones are dispatched.
pub(crate) struct Worker {
    tree: IndexingTree,
    notifier: FileNotifier,
    miner: MinerFs,
    extractors: Arc<ExtractorRegistry>,
    mailbox: Arc<Mailbox>,
    state: Arc<SharedState>,
    msgs: Vec<Msg>,
    tree_events: Vec<TreeEvent>,
    file_events: Vec<FileEvent>,
    miner_events: Vec<MinerEvent>,
    /// earliest moment the next dispatch tick may run (throttle)
    next_tick: Option<Instant>,
    shutdown: bool,
}

impl Worker {
    pub(crate) fn new(
        tree: IndexingTree,
        notifier: FileNotifier,
        miner: MinerFs,
        extractors: Arc<ExtractorRegistry>,
        mailbox: Arc<Mailbox>,
        state: Arc<SharedState>,
    ) -> Worker {
        Worker {
            tree,
            notifier,
            miner,
            extractors,
            mailbox,
            state,
            msgs: Vec::new(),
            tree_events: Vec::new(),
            file_events: Vec::new(),
            miner_events: Vec::new(),
            next_tick: None,
            shutdown: false,
        }
    }

    pub(crate) fn run(mut self) {
        loop {
            self.wait_for_work();
            if self.shutdown {
                break;
            }

            let msgs: Vec<Msg> = self.msgs.drain(..).collect();
            for msg in msgs {
                self.handle_msg(msg);
            }
            self.pump();

            // backpressure is sampled at batch boundaries only
            self.notifier.set_high_water(self.miner.high_water());

            if self.notifier.step(&self.tree, &mut self.file_events) {
                self.pump();
            }

            self.maybe_tick();
            self.emit();
        }
    }

    fn wait_for_work(&mut self) {
        // reconcile work and undelivered events keep the loop hot
        if self.notifier.can_step() || !self.file_events.is_empty() {
            self.mailbox.drain(&mut self.msgs);
            return;
        }
        if self.miner.wants_tick() {
            // dispatch is pending; sleep out the throttle spacing only
            let until_tick = self
                .next_tick
                .map(|at| at.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::ZERO);
            if until_tick.is_zero() {
                self.mailbox.drain(&mut self.msgs);
            } else {
                self.mailbox.wait(&mut self.msgs, until_tick.min(IDLE_WAIT));
            }
            return;
        }
        self.mailbox.wait(&mut self.msgs, IDLE_WAIT);
    }

    fn handle_msg(&mut self, msg: Msg) {
        match msg {
            Msg::Control(control) => self.handle_control(control),
            Msg::Monitor(event) => {
                self.notifier
                    .handle_monitor_event(&self.tree, event, &mut self.file_events);
            }
            Msg::FlushDone { result } => {
                self.miner.on_flush_done(result, &mut self.miner_events);
            }
        }
        self.apply_tree_events();
    }

    fn handle_control(&mut self, control: ControlMsg) {
        match control {
            ControlMsg::AddRoot { path, flags } => {
                self.tree.add(&path, flags, &mut self.tree_events)
            }
            ControlMsg::RemoveRoot { path } => self.tree.remove(&path, &mut self.tree_events),
            ControlMsg::AddFilter { kind, pattern } => self.tree.add_filter(kind, &pattern),
            ControlMsg::ClearFilters { kind } => self.tree.clear_filters(kind),
            ControlMsg::AddTextPattern { pattern } => self.tree.add_allowed_text_pattern(&pattern),
            ControlMsg::ClearTextPatterns => self.tree.clear_allowed_text_patterns(),
            ControlMsg::SetFilterHidden(filter_hidden) => {
                self.tree.set_filter_hidden(filter_hidden)
            }
            ControlMsg::SetThrottle(throttle) => self.miner.set_throttle(throttle),
            ControlMsg::SetExtractorHash { mimetype, hash } => {
                self.extractors.set_hash(&mimetype, &hash)
            }
            ControlMsg::NotifyUpdate { path, recursive } => {
                self.tree.notify_update(&path, recursive, &mut self.tree_events);
            }
            ControlMsg::SaveConfig { path } => {
                if let Err(err) = self.tree.save_config(&path) {
                    log::warn!("could not save configuration snapshot to {path:?}: {err}");
                }
            }
            ControlMsg::CheckConfig { path } => {
                self.tree.check_config(&path, &mut self.tree_events);
            }
            ControlMsg::Start => {
                self.notifier.start();
                self.miner.set_paused(false);
            }
            ControlMsg::Stop => {
                self.notifier.stop();
                self.miner.set_paused(true);
            }
            ControlMsg::Shutdown => self.shutdown = true,
        }
    }

    fn apply_tree_events(&mut self) {
        let events: Vec<TreeEvent> = self.tree_events.drain(..).collect();
        for event in events {
            self.miner.handle_tree_event(&event);
            self.notifier
                .handle_tree_event(&self.tree, &event, &mut self.file_events);
        }
    }

    /// Feeds pending logical events into the miner queue.
    fn pump(&mut self) {
        let events: Vec<FileEvent> = self.file_events.drain(..).collect();
        for event in events {
            self.miner.handle_file_event(&self.tree, event, &mut self.miner_events);
        }
    }

    fn maybe_tick(&mut self) {
        if !self.miner.wants_tick() {
            return;
        }
        if self.next_tick.is_some_and(|at| Instant::now() < at) {
            return;
        }
        self.miner.dispatch_tick(&self.tree, &self.notifier, &mut self.miner_events);
        // a throttle of θ spaces ticks by θ seconds; zero runs at idle
        // priority, which the cooperative loop already provides
        let throttle = self.miner.throttle();
        self.next_tick = (throttle > 0.0)
            .then(|| Instant::now() + Duration::from_secs_f64(throttle));
    }

    fn emit(&mut self) {
        if !self.miner_events.is_empty() {
            self.state.emit(&mut self.miner_events);
        }
    }
}
