//! Activation state machine.
//!
//! The controller never touches the socket itself. Every input returns a
//! [`Directive`] that the runtime executes, and connect outcomes are reported
//! back through [`ActivationController::connect_succeeded`] and
//! [`ActivationController::connect_failed`].

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionMode {
    Off,
    #[default]
    Auto,
    Manual,
}

impl fmt::Display for DetectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::Auto => "auto",
            Self::Manual => "manual",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivationState {
    Disabled,
    /// Night window holds in auto mode; fullscreen polling is armed.
    AutoIdle,
    AutoActive,
    ManualActive,
}

impl ActivationState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::AutoActive | Self::ManualActive)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionIndicator {
    Off,
    AutoArmed,
    ManualEngaged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReason {
    Fullscreen,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    DayStarted,
    FullscreenLost,
    ManualOff,
    ModeChanged,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Stay,
    Connect(ConnectReason),
    Disconnect(DisconnectReason),
}

#[derive(Debug, Clone)]
pub struct ActivationController {
    mode: DetectionMode,
    /// Mode to restore once manual mode is released.
    saved_mode: Option<DetectionMode>,
    state: ActivationState,
    night_active: bool,
    fullscreen_detected: bool,
    /// Set on manual release; auto re-engages only after fullscreen is seen gone.
    awaiting_fullscreen_exit: bool,
    attached_window: Option<String>,
    status: String,
}

impl ActivationController {
    pub fn new(mode: DetectionMode, night_active: bool) -> Self {
        let mut controller = Self {
            mode,
            saved_mode: None,
            state: ActivationState::Disabled,
            night_active,
            fullscreen_detected: false,
            awaiting_fullscreen_exit: false,
            attached_window: None,
            status: String::new(),
        };
        controller.state = controller.resting_state();
        controller
    }

    pub fn mode(&self) -> DetectionMode {
        self.mode
    }

    pub fn state(&self) -> ActivationState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn night_active(&self) -> bool {
        self.night_active
    }

    pub fn fullscreen_detected(&self) -> bool {
        self.fullscreen_detected
    }

    /// Fullscreen polling runs while armed or while an auto session is live.
    pub fn polling_armed(&self) -> bool {
        matches!(
            self.state,
            ActivationState::AutoIdle | ActivationState::AutoActive
        )
    }

    pub fn attached_window(&self) -> Option<&str> {
        self.attached_window.as_deref()
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn indicator(&self) -> DetectionIndicator {
        if self.state == ActivationState::ManualActive || self.mode == DetectionMode::Manual {
            DetectionIndicator::ManualEngaged
        } else if self.mode == DetectionMode::Off || self.state == ActivationState::Disabled {
            DetectionIndicator::Off
        } else {
            DetectionIndicator::AutoArmed
        }
    }

    pub fn observe_night(&mut self, night: bool) -> Directive {
        if night != self.night_active {
            debug!(night, "night window changed");
        }
        self.night_active = night;

        if self.mode != DetectionMode::Auto {
            return Directive::Stay;
        }
        match (night, self.state) {
            (true, ActivationState::Disabled) => {
                self.transition(ActivationState::AutoIdle);
                Directive::Stay
            }
            (false, ActivationState::AutoIdle) => {
                self.transition(ActivationState::Disabled);
                Directive::Stay
            }
            (false, ActivationState::AutoActive) => {
                self.transition(ActivationState::Disabled);
                self.attached_window = None;
                Directive::Disconnect(DisconnectReason::DayStarted)
            }
            _ => Directive::Stay,
        }
    }

    pub fn observe_fullscreen(&mut self, fullscreen: bool, title: Option<&str>) -> Directive {
        self.fullscreen_detected = fullscreen;
        if !fullscreen {
            self.awaiting_fullscreen_exit = false;
        }
        match (fullscreen, self.state) {
            (true, ActivationState::AutoIdle) if self.awaiting_fullscreen_exit => Directive::Stay,
            (true, ActivationState::AutoIdle) => {
                self.attached_window = title.map(str::to_owned);
                Directive::Connect(ConnectReason::Fullscreen)
            }
            (false, ActivationState::AutoActive) => {
                self.transition(ActivationState::AutoIdle);
                self.attached_window = None;
                Directive::Disconnect(DisconnectReason::FullscreenLost)
            }
            _ => Directive::Stay,
        }
    }

    pub fn toggle_manual(&mut self) -> Directive {
        self.set_manual(!self.is_connected())
    }

    pub fn set_manual(&mut self, engage: bool) -> Directive {
        match (engage, self.state) {
            (true, state) if state.is_connected() => Directive::Stay,
            (true, _) => {
                self.saved_mode = Some(self.mode);
                self.mode = DetectionMode::Manual;
                Directive::Connect(ConnectReason::Manual)
            }
            (false, ActivationState::ManualActive) => {
                self.awaiting_fullscreen_exit = true;
                self.restore_saved_mode();
                self.transition(self.resting_state());
                Directive::Disconnect(DisconnectReason::ManualOff)
            }
            (false, ActivationState::AutoActive) => {
                self.awaiting_fullscreen_exit = true;
                self.transition(ActivationState::AutoIdle);
                self.attached_window = None;
                Directive::Disconnect(DisconnectReason::ManualOff)
            }
            (false, _) => Directive::Stay,
        }
    }

    pub fn set_mode(&mut self, mode: DetectionMode) -> Directive {
        if self.state == ActivationState::ManualActive {
            // Locked while manual mode is engaged; applied on release.
            self.saved_mode = Some(mode);
            return Directive::Stay;
        }
        if mode == self.mode {
            return Directive::Stay;
        }
        info!(from = %self.mode, to = %mode, "detection mode changed");
        self.mode = mode;

        let was_active = self.state == ActivationState::AutoActive;
        self.transition(self.resting_state());
        if was_active && mode != DetectionMode::Auto {
            self.attached_window = None;
            Directive::Disconnect(DisconnectReason::ModeChanged)
        } else {
            Directive::Stay
        }
    }

    pub fn connect_succeeded(&mut self, reason: ConnectReason) {
        self.status = "Connected.".to_string();
        match reason {
            ConnectReason::Manual => self.transition(ActivationState::ManualActive),
            ConnectReason::Fullscreen => self.transition(ActivationState::AutoActive),
        }
    }

    pub fn connect_failed(&mut self, reason: ConnectReason, message: impl Into<String>) {
        self.status = message.into();
        if reason == ConnectReason::Manual {
            self.restore_saved_mode();
        }
        self.attached_window = None;
        self.transition(self.resting_state());
    }

    /// The socket was dropped underneath an active session (write failure).
    pub fn connection_lost(&mut self, message: impl Into<String>) {
        self.status = message.into();
        if self.state == ActivationState::ManualActive {
            self.restore_saved_mode();
        }
        self.attached_window = None;
        self.transition(self.resting_state());
    }

    /// Records the outcome of a disconnect directive.
    pub fn disconnected(&mut self) {
        self.status = "Disconnected.".to_string();
    }

    pub fn shutdown(&mut self) -> Directive {
        let was_connected = self.is_connected();
        if self.state == ActivationState::ManualActive {
            self.restore_saved_mode();
        }
        self.attached_window = None;
        self.transition(ActivationState::Disabled);
        if was_connected {
            Directive::Disconnect(DisconnectReason::Shutdown)
        } else {
            Directive::Stay
        }
    }

    fn resting_state(&self) -> ActivationState {
        if self.mode == DetectionMode::Auto && self.night_active {
            ActivationState::AutoIdle
        } else {
            ActivationState::Disabled
        }
    }

    fn restore_saved_mode(&mut self) {
        if let Some(mode) = self.saved_mode.take() {
            self.mode = mode;
        }
    }

    fn transition(&mut self, next: ActivationState) {
        if self.state != next {
            info!(from = ?self.state, to = ?next, mode = %self.mode, "activation state changed");
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn armed() -> ActivationController {
        let controller = ActivationController::new(DetectionMode::Auto, true);
        assert_eq!(controller.state(), ActivationState::AutoIdle);
        controller
    }

    #[test]
    fn initial_state_follows_mode_and_night() {
        assert_eq!(
            ActivationController::new(DetectionMode::Auto, true).state(),
            ActivationState::AutoIdle
        );
        assert_eq!(
            ActivationController::new(DetectionMode::Auto, false).state(),
            ActivationState::Disabled
        );
        assert_eq!(
            ActivationController::new(DetectionMode::Off, true).state(),
            ActivationState::Disabled
        );
    }

    #[test]
    fn fullscreen_while_armed_connects() {
        let mut controller = armed();
        let directive = controller.observe_fullscreen(true, Some("Movie"));
        assert_eq!(directive, Directive::Connect(ConnectReason::Fullscreen));
        assert_eq!(controller.state(), ActivationState::AutoIdle);

        controller.connect_succeeded(ConnectReason::Fullscreen);
        assert_eq!(controller.state(), ActivationState::AutoActive);
        assert!(controller.is_connected());
        assert_eq!(controller.attached_window(), Some("Movie"));

        assert_eq!(controller.observe_fullscreen(true, Some("Movie")), Directive::Stay);
    }

    #[test]
    fn fullscreen_lost_tears_down() {
        let mut controller = armed();
        controller.observe_fullscreen(true, None);
        controller.connect_succeeded(ConnectReason::Fullscreen);

        let directive = controller.observe_fullscreen(false, None);
        assert_eq!(directive, Directive::Disconnect(DisconnectReason::FullscreenLost));
        assert_eq!(controller.state(), ActivationState::AutoIdle);
        assert!(controller.polling_armed());
        assert_eq!(controller.attached_window(), None);
    }

    #[test]
    fn failed_fullscreen_connect_stays_idle() {
        let mut controller = armed();
        controller.observe_fullscreen(true, Some("Game"));
        controller.connect_failed(ConnectReason::Fullscreen, "connection refused");
        assert_eq!(controller.state(), ActivationState::AutoIdle);
        assert_eq!(controller.status(), "connection refused");
        assert_eq!(
            controller.observe_fullscreen(true, Some("Game")),
            Directive::Connect(ConnectReason::Fullscreen)
        );
    }

    #[test]
    fn manual_off_holds_auto_until_fullscreen_exits() {
        let mut controller = armed();
        controller.observe_fullscreen(true, Some("Movie"));
        controller.connect_succeeded(ConnectReason::Fullscreen);

        assert_eq!(
            controller.toggle_manual(),
            Directive::Disconnect(DisconnectReason::ManualOff)
        );
        assert_eq!(controller.state(), ActivationState::AutoIdle);
        assert!(controller.polling_armed());
        assert_eq!(controller.observe_fullscreen(true, Some("Movie")), Directive::Stay);
        assert!(controller.fullscreen_detected());

        assert_eq!(controller.observe_fullscreen(false, None), Directive::Stay);
        assert_eq!(
            controller.observe_fullscreen(true, Some("Movie")),
            Directive::Connect(ConnectReason::Fullscreen)
        );
    }

    #[test]
    fn manual_release_with_fullscreen_open_does_not_hand_over_to_auto() {
        let mut controller = armed();
        controller.toggle_manual();
        controller.connect_succeeded(ConnectReason::Manual);
        controller.toggle_manual();
        assert_eq!(controller.state(), ActivationState::AutoIdle);

        assert_eq!(controller.observe_fullscreen(true, None), Directive::Stay);
        controller.observe_fullscreen(false, None);
        assert_eq!(
            controller.observe_fullscreen(true, None),
            Directive::Connect(ConnectReason::Fullscreen)
        );
    }

    #[test]
    fn daybreak_disconnects_auto_session() {
        let mut controller = armed();
        controller.observe_fullscreen(true, None);
        controller.connect_succeeded(ConnectReason::Fullscreen);

        assert_eq!(
            controller.observe_night(false),
            Directive::Disconnect(DisconnectReason::DayStarted)
        );
        assert_eq!(controller.state(), ActivationState::Disabled);
        assert!(!controller.polling_armed());
        assert_eq!(controller.observe_fullscreen(true, None), Directive::Stay);

        assert_eq!(controller.observe_night(true), Directive::Stay);
        assert_eq!(controller.state(), ActivationState::AutoIdle);
    }

    #[test]
    fn manual_toggle_saves_and_restores_mode() {
        for initial in [DetectionMode::Off, DetectionMode::Auto] {
            let mut controller = ActivationController::new(initial, true);

            assert_eq!(
                controller.toggle_manual(),
                Directive::Connect(ConnectReason::Manual)
            );
            assert_eq!(controller.mode(), DetectionMode::Manual);
            controller.connect_succeeded(ConnectReason::Manual);
            assert_eq!(controller.state(), ActivationState::ManualActive);
            assert_eq!(controller.indicator(), DetectionIndicator::ManualEngaged);

            assert_eq!(
                controller.toggle_manual(),
                Directive::Disconnect(DisconnectReason::ManualOff)
            );
            assert_eq!(controller.mode(), initial);
            let expected = if initial == DetectionMode::Auto {
                ActivationState::AutoIdle
            } else {
                ActivationState::Disabled
            };
            assert_eq!(controller.state(), expected);
        }
    }

    #[test]
    fn failed_manual_connect_restores_mode() {
        let mut controller = ActivationController::new(DetectionMode::Auto, false);
        controller.set_manual(true);
        controller.connect_failed(ConnectReason::Manual, "host unreachable");
        assert_eq!(controller.mode(), DetectionMode::Auto);
        assert_eq!(controller.state(), ActivationState::Disabled);
        assert_eq!(controller.indicator(), DetectionIndicator::Off);
    }

    #[test]
    fn manual_session_ignores_night_and_fullscreen() {
        let mut controller = armed();
        controller.set_manual(true);
        controller.connect_succeeded(ConnectReason::Manual);

        assert_eq!(controller.observe_night(false), Directive::Stay);
        assert_eq!(controller.observe_fullscreen(false, None), Directive::Stay);
        assert_eq!(controller.state(), ActivationState::ManualActive);
    }

    #[test]
    fn mode_change_while_manual_is_applied_on_release() {
        let mut controller = armed();
        controller.set_manual(true);
        controller.connect_succeeded(ConnectReason::Manual);

        assert_eq!(controller.set_mode(DetectionMode::Off), Directive::Stay);
        assert_eq!(controller.mode(), DetectionMode::Manual);

        controller.set_manual(false);
        assert_eq!(controller.mode(), DetectionMode::Off);
        assert_eq!(controller.state(), ActivationState::Disabled);
    }

    #[test]
    fn leaving_auto_while_active_tears_down() {
        for mode in [DetectionMode::Off, DetectionMode::Manual] {
            let mut controller = armed();
            controller.observe_fullscreen(true, None);
            controller.connect_succeeded(ConnectReason::Fullscreen);

            assert_eq!(
                controller.set_mode(mode),
                Directive::Disconnect(DisconnectReason::ModeChanged)
            );
            assert_eq!(controller.state(), ActivationState::Disabled);
        }
    }

    #[test]
    fn indicator_reflects_mode_and_night() {
        let mut controller = ActivationController::new(DetectionMode::Auto, false);
        assert_eq!(controller.indicator(), DetectionIndicator::Off);
        controller.observe_night(true);
        assert_eq!(controller.indicator(), DetectionIndicator::AutoArmed);
        controller.set_mode(DetectionMode::Manual);
        assert_eq!(controller.indicator(), DetectionIndicator::ManualEngaged);
        controller.set_mode(DetectionMode::Off);
        assert_eq!(controller.indicator(), DetectionIndicator::Off);
    }

    #[test]
    fn lost_connection_resets_manual_session() {
        let mut controller = armed();
        controller.set_manual(true);
        controller.connect_succeeded(ConnectReason::Manual);

        controller.connection_lost("write failed: broken pipe");
        assert_eq!(controller.state(), ActivationState::AutoIdle);
        assert_eq!(controller.mode(), DetectionMode::Auto);
        assert!(!controller.is_connected());
    }

    #[test]
    fn shutdown_disconnects_only_when_connected() {
        let mut controller = armed();
        assert_eq!(controller.shutdown(), Directive::Stay);

        let mut controller = armed();
        controller.set_manual(true);
        controller.connect_succeeded(ConnectReason::Manual);
        assert_eq!(
            controller.shutdown(),
            Directive::Disconnect(DisconnectReason::Shutdown)
        );
        assert_eq!(controller.state(), ActivationState::Disabled);
    }
}
