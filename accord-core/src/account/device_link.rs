//! The link-device protocol: a pure state machine driven on both the new
//! device (importer) and source device (exporter) sides.
//!
//! `HANDSHAKE -> EST -> AUTH -> DATA -> DONE` with error sinks `ERR`,
//! `AUTH_ERROR`, `TIMEOUT`, `CANCELED`. Every transition is
//! `(state, event) -> (state', effects)`; nothing here touches I/O.

use std::collections::BTreeMap;

use crate::events::{DoneResult, LinkState};

pub const SCHEME_ID: u8 = 0;
pub const OP_TIMEOUT_SECS: u64 = 5 * 60;
pub const MAX_TRIES: u32 = 3;

/// The wire message: `{scheme_id, payload}`. `scheme_id != 0` sinks
/// immediately to `Err` wherever it's observed.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct LinkMessage {
    pub scheme_id: u8,
    pub payload: BTreeMap<String, String>,
}

impl LinkMessage {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        Self {
            scheme_id: SCHEME_ID,
            payload: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Handshake,
    Est,
    Auth,
    Data,
    Done,
    Err,
    AuthError,
    Timeout,
    Canceled,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            State::Done | State::Err | State::AuthError | State::Timeout | State::Canceled
        )
    }
}

/// Input driving a transition.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The control channel connected.
    Connected { peer: String },
    /// A framed message arrived from the peer.
    Message(LinkMessage),
    /// The embedding user supplied a password (`provideAccountAuthentication`).
    UserProvidedPassword(String),
    /// The embedding user picked an auth scheme and confirmed (`confirmAddDevice`).
    UserConfirmed { scheme: String },
    /// The embedding user canceled (`cancelAddDevice`).
    UserCanceled,
    /// Whether a password attempt (source side only) decrypted the archive.
    PasswordAttempt { password: String, correct: bool },
    TimedOut,
    ShutDown,
}

/// Output of a transition: something to send, an event to emit, or a
/// shutdown request.
#[derive(Debug, Clone)]
pub enum LinkEffect {
    Send(LinkMessage),
    EmitState(LinkState),
    EmitDone(DoneResult),
    Shutdown,
}

fn done_result_for(state: State) -> DoneResult {
    match state {
        State::Done => DoneResult::Success,
        State::AuthError | State::Err => DoneResult::AuthError,
        State::Timeout => DoneResult::Timeout,
        State::Canceled => DoneResult::Canceled,
        _ => DoneResult::Unknown,
    }
}

/// New-device (importer) side of the protocol.
pub struct NewDeviceLink {
    pub state: State,
    peer: Option<String>,
    scheme: Option<String>,
}

impl NewDeviceLink {
    pub fn new() -> Self {
        Self {
            state: State::Handshake,
            peer: None,
            scheme: None,
        }
    }

    pub fn step(&mut self, event: LinkEvent) -> Vec<LinkEffect> {
        if self.state.is_terminal() {
            return Vec::new();
        }

        match (self.state, event) {
            (State::Handshake, LinkEvent::Connected { peer }) => {
                self.peer = Some(peer);
                vec![LinkEffect::EmitState(LinkState::Connecting)]
            }
            (State::Handshake, LinkEvent::Message(msg)) => {
                if msg.scheme_id != SCHEME_ID {
                    self.state = State::Err;
                    return vec![LinkEffect::EmitDone(DoneResult::Unknown), LinkEffect::Shutdown];
                }
                let Some(scheme) = msg.payload.get("authScheme").cloned() else {
                    return Vec::new();
                };
                self.scheme = Some(scheme.clone());
                self.state = State::Auth;
                tracing::debug!(scheme = %scheme, "new device entering auth");
                vec![LinkEffect::EmitState(LinkState::Authenticating {
                    peer: self.peer.clone().unwrap_or_default(),
                    scheme: Some(scheme),
                    auth_error: None,
                })]
            }
            (State::Auth, LinkEvent::UserProvidedPassword(password)) => {
                self.state = State::Data;
                vec![LinkEffect::Send(LinkMessage::new(&[("password", &password)]))]
            }
            (State::Data, LinkEvent::Message(msg)) => {
                if msg.scheme_id != SCHEME_ID {
                    self.state = State::Err;
                    return vec![LinkEffect::EmitDone(DoneResult::Unknown), LinkEffect::Shutdown];
                }
                if let Some(acc_data) = msg.payload.get("accData") {
                    let _ = acc_data;
                    self.state = State::Done;
                    tracing::info!("new device link completed");
                    return vec![LinkEffect::EmitState(LinkState::InProgress), LinkEffect::EmitDone(DoneResult::Success), LinkEffect::Shutdown];
                }
                let correct = msg.payload.get("passwordCorrect").map(|v| v == "true");
                let can_retry = msg.payload.get("canRetry").map(|v| v == "true").unwrap_or(false);
                match correct {
                    Some(false) if can_retry => {
                        self.state = State::Auth;
                        vec![LinkEffect::EmitState(LinkState::Authenticating {
                            peer: self.peer.clone().unwrap_or_default(),
                            scheme: self.scheme.clone(),
                            auth_error: Some("invalid_credentials".to_string()),
                        })]
                    }
                    Some(false) => {
                        self.state = State::AuthError;
                        Vec::new()
                    }
                    _ => Vec::new(),
                }
            }
            (_, LinkEvent::TimedOut) => {
                self.state = State::Timeout;
                vec![LinkEffect::Send(LinkMessage::new(&[("stateMsg", "TIMEOUT")]))]
            }
            (_, LinkEvent::ShutDown) => {
                let result = done_result_for(self.state);
                if self.state != State::Done && !self.state.is_terminal() {
                    self.state = State::Err;
                }
                vec![LinkEffect::EmitDone(result)]
            }
            _ => Vec::new(),
        }
    }
}

impl Default for NewDeviceLink {
    fn default() -> Self {
        Self::new()
    }
}

/// Source-device (exporter) side of the protocol. Password retries are
/// counted here, never on the new device.
pub struct SourceDeviceLink {
    pub state: State,
    tries: u32,
}

impl SourceDeviceLink {
    pub fn new() -> Self {
        Self {
            state: State::Handshake,
            tries: 0,
        }
    }

    pub fn step(&mut self, event: LinkEvent) -> Vec<LinkEffect> {
        if self.state.is_terminal() {
            return Vec::new();
        }

        match (self.state, event) {
            (State::Handshake, LinkEvent::Connected { peer }) => {
                self.state = State::Est;
                vec![LinkEffect::EmitState(LinkState::Authenticating {
                    peer,
                    scheme: None,
                    auth_error: None,
                })]
            }
            (State::Est, LinkEvent::UserConfirmed { scheme }) => {
                self.state = State::Auth;
                vec![LinkEffect::Send(LinkMessage::new(&[("authScheme", &scheme)]))]
            }
            (State::Auth, LinkEvent::PasswordAttempt { password, correct }) => {
                let _ = password;
                if correct {
                    self.state = State::Done;
                    tracing::info!("source device authenticated new device");
                    vec![
                        LinkEffect::Send(LinkMessage::new(&[("accData", "")])),
                        LinkEffect::EmitDone(DoneResult::Success),
                        LinkEffect::Shutdown,
                    ]
                } else {
                    self.tries += 1;
                    if self.tries < MAX_TRIES {
                        tracing::debug!(tries = self.tries, "wrong password, retry offered");
                        vec![LinkEffect::Send(LinkMessage::new(&[
                            ("passwordCorrect", "false"),
                            ("canRetry", "true"),
                        ]))]
                    } else {
                        self.state = State::AuthError;
                        tracing::warn!("link auth failed after max retries");
                        vec![
                            LinkEffect::Send(LinkMessage::new(&[("canRetry", "false")])),
                            LinkEffect::EmitDone(DoneResult::AuthError),
                            LinkEffect::Shutdown,
                        ]
                    }
                }
            }
            (_, LinkEvent::UserCanceled) => {
                self.state = State::Canceled;
                vec![
                    LinkEffect::Send(LinkMessage::new(&[("stateMsg", "CANCELED")])),
                    LinkEffect::EmitDone(DoneResult::Canceled),
                    LinkEffect::Shutdown,
                ]
            }
            (_, LinkEvent::TimedOut) => {
                self.state = State::Timeout;
                vec![
                    LinkEffect::Send(LinkMessage::new(&[("stateMsg", "TIMEOUT")])),
                    LinkEffect::EmitDone(DoneResult::Timeout),
                    LinkEffect::Shutdown,
                ]
            }
            (_, LinkEvent::ShutDown) => {
                let result = done_result_for(self.state);
                vec![LinkEffect::EmitDone(result)]
            }
            _ => Vec::new(),
        }
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }
}

impl Default for SourceDeviceLink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_done(effects: &[LinkEffect], want: DoneResult) -> bool {
        effects
            .iter()
            .any(|e| matches!(e, LinkEffect::EmitDone(r) if *r == want))
    }

    #[test]
    fn new_device_handshake_to_auth() {
        let mut link = NewDeviceLink::new();
        link.step(LinkEvent::Connected { peer: "srcdev".to_string() });
        let effects = link.step(LinkEvent::Message(LinkMessage::new(&[("authScheme", "password")])));
        assert_eq!(link.state, State::Auth);
        assert!(matches!(
            effects[0],
            LinkEffect::EmitState(LinkState::Authenticating { .. })
        ));
    }

    #[test]
    fn scenario_s4_two_wrong_then_right_password() {
        let mut new_device = NewDeviceLink::new();
        let mut source = SourceDeviceLink::new();

        source.step(LinkEvent::Connected { peer: "newdev".to_string() });
        source.step(LinkEvent::UserConfirmed { scheme: "password".to_string() });
        new_device.step(LinkEvent::Connected { peer: "srcdev".to_string() });
        new_device.step(LinkEvent::Message(LinkMessage::new(&[("authScheme", "password")])));

        new_device.step(LinkEvent::UserProvidedPassword("x".to_string()));
        let source_effects = source.step(LinkEvent::PasswordAttempt {
            password: "x".to_string(),
            correct: false,
        });
        assert_eq!(source.tries(), 1);
        assert!(!has_done(&source_effects, DoneResult::AuthError));

        let new_device_effects = new_device.step(LinkEvent::Message(LinkMessage::new(&[
            ("passwordCorrect", "false"),
            ("canRetry", "true"),
        ])));
        assert_eq!(new_device.state, State::Auth);
        assert!(matches!(
            new_device_effects[0],
            LinkEffect::EmitState(LinkState::Authenticating {
                auth_error: Some(_),
                ..
            })
        ));

        new_device.step(LinkEvent::UserProvidedPassword("x".to_string()));
        source.step(LinkEvent::PasswordAttempt {
            password: "x".to_string(),
            correct: false,
        });
        assert_eq!(source.tries(), 2);

        new_device.step(LinkEvent::UserProvidedPassword("correct".to_string()));
        let source_effects = source.step(LinkEvent::PasswordAttempt {
            password: "correct".to_string(),
            correct: true,
        });
        assert!(has_done(&source_effects, DoneResult::Success));
        assert_eq!(source.state, State::Done);

        let new_device_effects = new_device.step(LinkEvent::Message(LinkMessage::new(&[("accData", "e30=")])));
        assert!(has_done(&new_device_effects, DoneResult::Success));
        assert_eq!(new_device.state, State::Done);
    }

    #[test]
    fn scenario_s5_three_wrong_passwords() {
        let mut source = SourceDeviceLink::new();
        source.step(LinkEvent::Connected { peer: "newdev".to_string() });
        source.step(LinkEvent::UserConfirmed { scheme: "password".to_string() });

        for _ in 0..2 {
            let effects = source.step(LinkEvent::PasswordAttempt {
                password: "wrong".to_string(),
                correct: false,
            });
            assert!(!has_done(&effects, DoneResult::AuthError));
        }
        let effects = source.step(LinkEvent::PasswordAttempt {
            password: "wrong".to_string(),
            correct: false,
        });
        assert!(has_done(&effects, DoneResult::AuthError));
        assert_eq!(source.state, State::AuthError);
        assert_eq!(source.tries(), 3);
    }

    #[test]
    fn unknown_scheme_id_sinks_to_err() {
        let mut link = NewDeviceLink::new();
        link.step(LinkEvent::Connected { peer: "srcdev".to_string() });
        let effects = link.step(LinkEvent::Message(LinkMessage {
            scheme_id: 7,
            payload: BTreeMap::new(),
        }));
        assert_eq!(link.state, State::Err);
        assert!(has_done(&effects, DoneResult::Unknown));
    }

    #[test]
    fn cancel_on_source_shuts_down_with_canceled() {
        let mut source = SourceDeviceLink::new();
        source.step(LinkEvent::Connected { peer: "newdev".to_string() });
        let effects = source.step(LinkEvent::UserCanceled);
        assert!(has_done(&effects, DoneResult::Canceled));
        assert_eq!(source.state, State::Canceled);

        assert!(source.step(LinkEvent::UserCanceled).is_empty());
    }

    #[test]
    fn timeout_emits_best_effort_state_message_on_both_sides() {
        let mut new_device = NewDeviceLink::new();
        let effects = new_device.step(LinkEvent::TimedOut);
        assert!(matches!(effects[0], LinkEffect::Send(_)));
        assert_eq!(new_device.state, State::Timeout);
    }
}
