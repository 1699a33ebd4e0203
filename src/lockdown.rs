//! Lockdown state machine
//!
//! [`LockdownController`] is pure: it turns events into state changes and a
//! list of [`LockdownAction`]s. [`LockdownDriver`] owns a controller, performs
//! the actions through a [`DisplayControl`] and feeds their outcome back in.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::LockdownPolicy;
use crate::context::DeviceEvent;
use crate::types::{locked, now_ms};
use crate::violation::{PlatformSignal, ViolationEngine};

/// Kiosk and fullscreen control of the primary device
#[async_trait]
pub trait DisplayControl: Send + Sync {
    /// Returns whether fullscreen was granted
    async fn request_fullscreen(&self) -> bool;

    /// Returns whether the interview window holds focus afterwards
    async fn request_focus(&self) -> bool;

    fn is_fullscreen(&self) -> bool;

    /// Block clipboard, context menu and devtools shortcuts
    fn attach_blockers(&self);

    fn detach_blockers(&self);

    async fn exit_fullscreen(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreachCause {
    FullscreenLost,
    FocusLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockdownState {
    Idle,
    Entering,
    Locked,
    Breached,
    Recovering { attempt: u32 },
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockdownEvent {
    Engage,
    FullscreenAcquired,
    FullscreenDenied,
    FullscreenLost,
    FocusLost,
    FocusRegained,
    /// Periodic check with the observed fullscreen state
    Watchdog { fullscreen: bool },
    RecoveryDue,
    /// Outcome of a recovery attempt
    Reasserted { restored: bool },
    Teardown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockdownAction {
    AttachBlockers,
    RequestFullscreen,
    /// Request focus and fullscreen again
    Reassert,
    ScheduleRecovery(Duration),
    ReportUnresolved { attempts: u32 },
    DetachBlockers,
    ExitFullscreen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditKind {
    Engaged,
    Locked,
    Breached(BreachCause),
    RecoveryAttempt(u32),
    Unresolved { attempts: u32 },
    Exited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub at_ms: i64,
    pub kind: AuditKind,
}

pub struct LockdownController {
    policy: LockdownPolicy,
    state: LockdownState,
    cause: Option<BreachCause>,
    /// A breach scheduled its first recovery attempt and is waiting on it
    recovery_pending: bool,
    focus_lost_at: Option<Instant>,
    audit: Vec<AuditEntry>,
}

impl LockdownController {
    pub fn new(policy: LockdownPolicy) -> Self {
        Self {
            policy,
            state: LockdownState::Idle,
            cause: None,
            recovery_pending: false,
            focus_lost_at: None,
            audit: Vec::new(),
        }
    }

    pub fn state(&self) -> LockdownState {
        self.state
    }

    pub fn audit(&self) -> &[AuditEntry] {
        &self.audit
    }

    /// Number of unresolved entries logged so far
    pub fn unresolved_count(&self) -> usize {
        self.audit
            .iter()
            .filter(|e| matches!(e.kind, AuditKind::Unresolved { .. }))
            .count()
    }

    fn log(&mut self, kind: AuditKind) {
        self.audit.push(AuditEntry { at_ms: now_ms(), kind });
    }

    fn lock(&mut self) -> Vec<LockdownAction> {
        self.state = LockdownState::Locked;
        self.cause = None;
        self.recovery_pending = false;
        self.focus_lost_at = None;
        self.log(AuditKind::Locked);
        Vec::new()
    }

    /// Stays `Breached` until the first scheduled recovery fires
    fn breach(&mut self, cause: BreachCause) -> Vec<LockdownAction> {
        self.log(AuditKind::Breached(cause));
        self.cause = Some(cause);
        self.state = LockdownState::Breached;
        self.recovery_pending = true;
        vec![LockdownAction::ScheduleRecovery(self.policy.recovery_spacing())]
    }

    pub fn handle(&mut self, event: LockdownEvent, now: Instant) -> Vec<LockdownAction> {
        use LockdownEvent as E;
        use LockdownState as S;

        if event == E::Teardown {
            return match self.state {
                S::Exited => Vec::new(),
                S::Idle => {
                    self.state = S::Exited;
                    Vec::new()
                }
                _ => {
                    self.state = S::Exited;
                    self.log(AuditKind::Exited);
                    vec![LockdownAction::DetachBlockers, LockdownAction::ExitFullscreen]
                }
            };
        }

        match (self.state, event) {
            (S::Idle, E::Engage) => {
                self.state = S::Entering;
                self.log(AuditKind::Engaged);
                vec![LockdownAction::AttachBlockers, LockdownAction::RequestFullscreen]
            }
            (S::Entering, E::FullscreenAcquired) => self.lock(),
            (S::Entering, E::FullscreenDenied) => self.breach(BreachCause::FullscreenLost),

            (S::Locked, E::FullscreenLost) | (S::Locked, E::Watchdog { fullscreen: false }) => {
                self.breach(BreachCause::FullscreenLost)
            }
            (S::Locked, E::FocusLost) => {
                self.focus_lost_at.get_or_insert(now);
                Vec::new()
            }
            (S::Locked, E::FocusRegained) => {
                self.focus_lost_at = None;
                Vec::new()
            }
            (S::Locked, E::Watchdog { fullscreen: true }) => match self.focus_lost_at {
                Some(since) if now.saturating_duration_since(since) >= self.policy.focus_loss_grace() => {
                    self.breach(BreachCause::FocusLost)
                }
                _ => Vec::new(),
            },

            (S::Breached, E::RecoveryDue) if self.recovery_pending => {
                self.recovery_pending = false;
                self.state = S::Recovering { attempt: 1 };
                self.log(AuditKind::RecoveryAttempt(1));
                vec![LockdownAction::Reassert]
            }
            (S::Recovering { attempt }, E::RecoveryDue) => {
                self.log(AuditKind::RecoveryAttempt(attempt));
                vec![LockdownAction::Reassert]
            }
            (S::Recovering { .. }, E::Reasserted { restored: true }) => self.lock(),
            (S::Recovering { attempt }, E::Reasserted { restored: false }) => {
                if attempt < self.policy.max_recovery_attempts {
                    self.state = S::Recovering {
                        attempt: attempt + 1,
                    };
                    vec![LockdownAction::ScheduleRecovery(self.policy.recovery_spacing())]
                } else {
                    self.state = S::Breached;
                    self.log(AuditKind::Unresolved { attempts: attempt });
                    vec![LockdownAction::ReportUnresolved { attempts: attempt }]
                }
            }

            // the candidate restoring the environment themselves re-locks
            (S::Breached, E::FullscreenAcquired)
            | (S::Recovering { .. }, E::FullscreenAcquired) => self.lock(),
            (S::Breached, E::FocusRegained) | (S::Recovering { .. }, E::FocusRegained)
                if self.cause == Some(BreachCause::FocusLost) =>
            {
                self.lock()
            }

            _ => Vec::new(),
        }
    }
}

/// Executes controller actions against the platform
pub struct LockdownDriver {
    controller: Mutex<LockdownController>,
    display: Arc<dyn DisplayControl>,
    engine: Option<Arc<ViolationEngine>>,
    events: broadcast::Sender<DeviceEvent>,
    watchdog: Duration,
    recovery_at: Mutex<Option<Instant>>,
}

impl LockdownDriver {
    pub fn new(
        policy: LockdownPolicy,
        display: Arc<dyn DisplayControl>,
        engine: Option<Arc<ViolationEngine>>,
        events: broadcast::Sender<DeviceEvent>,
    ) -> Self {
        Self {
            watchdog: policy.watchdog(),
            controller: Mutex::new(LockdownController::new(policy)),
            display,
            engine,
            events,
            recovery_at: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LockdownState {
        locked(&self.controller).state()
    }

    pub fn audit(&self) -> Vec<AuditEntry> {
        locked(&self.controller).audit().to_vec()
    }

    pub fn unresolved_count(&self) -> usize {
        locked(&self.controller).unresolved_count()
    }

    /// Keep the violation classifier aware of fullscreen we acquired, so a
    /// later exit is reported
    fn observe_fullscreen(&self) {
        if let Some(engine) = &self.engine {
            engine.ingest(&PlatformSignal::FullscreenChanged { fullscreen: true });
        }
    }

    /// Apply an event and every follow-up produced by its actions
    pub async fn dispatch(&self, event: LockdownEvent) {
        let mut pending = VecDeque::from([event]);
        while let Some(event) = pending.pop_front() {
            let (before, actions, after) = {
                let mut controller = locked(&self.controller);
                let before = controller.state();
                let actions = controller.handle(event, Instant::now());
                (before, actions, controller.state())
            };
            if before != after {
                debug!("[Lockdown] {:?} -> {:?} on {:?}", before, after, event);
                let _ = self.events.send(DeviceEvent::Lockdown(after));
            }

            for action in actions {
                match action {
                    LockdownAction::AttachBlockers => self.display.attach_blockers(),
                    LockdownAction::DetachBlockers => self.display.detach_blockers(),
                    LockdownAction::RequestFullscreen => {
                        let granted = self.display.request_fullscreen().await;
                        if granted {
                            self.observe_fullscreen();
                        } else {
                            warn!("[Lockdown] Fullscreen request denied");
                        }
                        pending.push_back(if granted {
                            LockdownEvent::FullscreenAcquired
                        } else {
                            LockdownEvent::FullscreenDenied
                        });
                    }
                    LockdownAction::Reassert => {
                        let restored = self.display.request_focus().await
                            && self.display.request_fullscreen().await;
                        if restored {
                            self.observe_fullscreen();
                        }
                        pending.push_back(LockdownEvent::Reasserted { restored });
                    }
                    LockdownAction::ScheduleRecovery(delay) => {
                        *locked(&self.recovery_at) = Some(Instant::now() + delay);
                    }
                    LockdownAction::ReportUnresolved { attempts } => {
                        warn!(
                            "[Lockdown] Recovery exhausted after {} attempt(s); session flagged",
                            attempts
                        );
                        if let Some(engine) = &self.engine {
                            engine.ingest(&PlatformSignal::LockdownUnresolved { attempts });
                        }
                    }
                    LockdownAction::ExitFullscreen => self.display.exit_fullscreen().await,
                }
            }

            if after == LockdownState::Locked && before != LockdownState::Locked {
                locked(&self.recovery_at).take();
                info!("[Lockdown] Environment locked");
            }
        }
    }

    /// Drive events, recovery timers and the watchdog until cancelled
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<LockdownEvent>,
        cancel: CancellationToken,
    ) {
        let mut watchdog = tokio::time::interval(self.watchdog);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let recovery_at = *locked(&self.recovery_at);
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = sleep_until_opt(recovery_at) => {
                    locked(&self.recovery_at).take();
                    LockdownEvent::RecoveryDue
                }
                _ = watchdog.tick() => LockdownEvent::Watchdog {
                    fullscreen: self.display.is_fullscreen(),
                },
            };
            self.dispatch(event).await;
        }
        debug!("[Lockdown] Driver stopped in {:?}", self.state());
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn controller() -> LockdownController {
        LockdownController::new(LockdownPolicy::default())
    }

    fn locked_controller(now: Instant) -> LockdownController {
        let mut c = controller();
        c.handle(LockdownEvent::Engage, now);
        c.handle(LockdownEvent::FullscreenAcquired, now);
        assert_eq!(c.state(), LockdownState::Locked);
        c
    }

    #[test]
    fn engage_attaches_blockers_and_requests_fullscreen() {
        let mut c = controller();
        let actions = c.handle(LockdownEvent::Engage, Instant::now());
        assert_eq!(
            actions,
            vec![LockdownAction::AttachBlockers, LockdownAction::RequestFullscreen]
        );
        assert_eq!(c.state(), LockdownState::Entering);
    }

    #[test]
    fn exhausted_recovery_logs_one_unresolved_entry() {
        let now = Instant::now();
        let mut c = locked_controller(now);
        let spacing = LockdownPolicy::default().recovery_spacing();

        assert_eq!(
            c.handle(LockdownEvent::FullscreenLost, now),
            vec![LockdownAction::ScheduleRecovery(spacing)]
        );
        assert_eq!(c.state(), LockdownState::Breached);
        let mut reasserts = 0;
        for _ in 0..3 {
            let actions = c.handle(LockdownEvent::RecoveryDue, now);
            assert_eq!(actions, vec![LockdownAction::Reassert]);
            reasserts += 1;
            c.handle(LockdownEvent::Reasserted { restored: false }, now);
        }
        assert_eq!(reasserts, 3);
        assert_eq!(c.state(), LockdownState::Breached);
        assert_eq!(c.unresolved_count(), 1);

        // nothing restarts recovery on its own
        c.handle(LockdownEvent::Watchdog { fullscreen: false }, now);
        c.handle(LockdownEvent::RecoveryDue, now);
        assert_eq!(c.state(), LockdownState::Breached);
        assert_eq!(c.unresolved_count(), 1);
    }

    #[test]
    fn successful_recovery_relocks() {
        let now = Instant::now();
        let mut c = locked_controller(now);
        c.handle(LockdownEvent::FullscreenLost, now);
        c.handle(LockdownEvent::RecoveryDue, now);
        c.handle(LockdownEvent::Reasserted { restored: false }, now);
        assert_eq!(c.state(), LockdownState::Recovering { attempt: 2 });
        c.handle(LockdownEvent::RecoveryDue, now);
        c.handle(LockdownEvent::Reasserted { restored: true }, now);
        assert_eq!(c.state(), LockdownState::Locked);
        assert_eq!(c.unresolved_count(), 0);
    }

    #[test]
    fn brief_focus_loss_is_tolerated() {
        let now = Instant::now();
        let grace = LockdownPolicy::default().focus_loss_grace();
        let mut c = locked_controller(now);

        c.handle(LockdownEvent::FocusLost, now);
        c.handle(LockdownEvent::Watchdog { fullscreen: true }, now + grace / 2);
        assert_eq!(c.state(), LockdownState::Locked);
        c.handle(LockdownEvent::FocusRegained, now + grace / 2);
        c.handle(LockdownEvent::Watchdog { fullscreen: true }, now + grace * 2);
        assert_eq!(c.state(), LockdownState::Locked);

        c.handle(LockdownEvent::FocusLost, now + grace * 2);
        c.handle(LockdownEvent::Watchdog { fullscreen: true }, now + grace * 3);
        assert_eq!(c.state(), LockdownState::Breached);

        c.handle(LockdownEvent::FocusRegained, now + grace * 3);
        assert_eq!(c.state(), LockdownState::Locked);
    }

    #[test]
    fn denied_initial_fullscreen_is_a_breach() {
        let now = Instant::now();
        let mut c = controller();
        c.handle(LockdownEvent::Engage, now);
        c.handle(LockdownEvent::FullscreenDenied, now);
        assert_eq!(c.state(), LockdownState::Breached);
        c.handle(LockdownEvent::RecoveryDue, now);
        assert_eq!(c.state(), LockdownState::Recovering { attempt: 1 });
    }

    #[test]
    fn breach_is_observable_until_recovery_fires() {
        let now = Instant::now();
        let mut c = locked_controller(now);

        c.handle(LockdownEvent::FullscreenLost, now);
        assert_eq!(c.state(), LockdownState::Breached);
        // the watchdog still sees no fullscreen; no second breach
        assert!(c
            .handle(LockdownEvent::Watchdog { fullscreen: false }, now)
            .is_empty());
        assert_eq!(c.state(), LockdownState::Breached);

        assert_eq!(
            c.handle(LockdownEvent::RecoveryDue, now),
            vec![LockdownAction::Reassert]
        );
        assert_eq!(c.state(), LockdownState::Recovering { attempt: 1 });
        let kinds: Vec<_> = c.audit().iter().map(|e| e.kind.clone()).collect();
        assert_eq!(
            kinds[kinds.len() - 2..].to_vec(),
            vec![
                AuditKind::Breached(BreachCause::FullscreenLost),
                AuditKind::RecoveryAttempt(1)
            ]
        );
    }

    #[test]
    fn user_return_to_fullscreen_relocks_after_unresolved() {
        let now = Instant::now();
        let mut c = locked_controller(now);
        c.handle(LockdownEvent::FullscreenLost, now);
        for _ in 0..3 {
            c.handle(LockdownEvent::RecoveryDue, now);
            c.handle(LockdownEvent::Reasserted { restored: false }, now);
        }
        assert_eq!(c.state(), LockdownState::Breached);
        c.handle(LockdownEvent::FullscreenAcquired, now);
        assert_eq!(c.state(), LockdownState::Locked);
    }

    #[test]
    fn teardown_exits_once() {
        let now = Instant::now();
        let mut c = locked_controller(now);
        assert_eq!(
            c.handle(LockdownEvent::Teardown, now),
            vec![LockdownAction::DetachBlockers, LockdownAction::ExitFullscreen]
        );
        assert_eq!(c.state(), LockdownState::Exited);
        assert!(c.handle(LockdownEvent::Teardown, now).is_empty());
        assert!(c.handle(LockdownEvent::Engage, now).is_empty());
    }
}
