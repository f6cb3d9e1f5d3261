//! Line-oriented command protocol spoken by TCP clients.
//!
//! ```text
//! list
//! register <name> <id> <role>
//! unregister <name>
//! mesg <name> <payload…>
//! speed <kbaud>
//! ```

use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::adapter::CAN_SPEED_RANGE;
use crate::registry::{Registry, RegistryError};
use crate::roles::Role;
use crate::supervisor::CtrlMsg;
use crate::util::parse_long;

/// Routes client commands to the registry, the workers and the CAN
/// supervisor. Replies are short status strings; `list` output travels over
/// the broadcast bus instead so every client sees it.
pub struct Router {
    registry: Arc<Registry>,
    ctrl: Sender<CtrlMsg>,
    broadcast: Sender<String>,
}

impl Router {
    pub fn new(registry: Arc<Registry>, ctrl: Sender<CtrlMsg>, broadcast: Sender<String>) -> Self {
        Self {
            registry,
            ctrl,
            broadcast,
        }
    }

    /// Handles one client line. Returns the reply for the issuing client,
    /// or `None` when the command answers through the broadcast bus only.
    pub fn process(&self, line: &str) -> Option<String> {
        let (verb, rest) = split_word(line);
        if verb.is_empty() {
            return None;
        }
        log::debug!("client command: {:?}", line.trim_end());

        Some(match verb.to_ascii_lowercase().as_str() {
            "list" => {
                for entry in self.registry.list() {
                    self.broadcast.send(entry).ok();
                }
                return None;
            }
            "register" => self.register(rest),
            "unregister" => {
                let (name, _) = split_word(rest);
                if name.is_empty() {
                    "Wrong command".to_owned()
                } else {
                    match self.registry.unregister(name) {
                        Ok(()) => "OK".to_owned(),
                        Err(_) => "Thread not found".to_owned(),
                    }
                }
            }
            "mesg" => {
                let (name, payload) = split_word(rest);
                if name.is_empty() || payload.is_empty() {
                    "Wrong command".to_owned()
                } else {
                    match self.registry.send_command(name, payload) {
                        Ok(()) => "OK".to_owned(),
                        Err(RegistryError::NotFound(_)) => "Thread not found".to_owned(),
                        Err(_) => "Can't send message".to_owned(),
                    }
                }
            }
            "speed" => {
                let (kbaud, _) = split_word(rest);
                match parse_long(kbaud).and_then(|v| u32::try_from(v).ok()) {
                    Some(kbaud) if kbaud == 0 || CAN_SPEED_RANGE.contains(&kbaud) => {
                        match self.ctrl.send(CtrlMsg::SetSpeed(kbaud)) {
                            Ok(()) => "OK".to_owned(),
                            Err(_) => "Can't send message".to_owned(),
                        }
                    }
                    _ => "Wrong speed".to_owned(),
                }
            }
            _ => "Wrong command".to_owned(),
        })
    }

    fn register(&self, rest: &str) -> String {
        let (name, rest) = split_word(rest);
        let (id_token, rest) = split_word(rest);
        let (role_token, _) = split_word(rest);
        if name.is_empty() || id_token.is_empty() || role_token.is_empty() {
            return "Wrong command".to_owned();
        }

        let id = match parse_long(id_token).and_then(|v| u16::try_from(v).ok()) {
            Some(id) if id <= 0x7FF => id,
            _ => return "Wrong CANID".to_owned(),
        };
        let role: Role = match role_token.parse() {
            Ok(role) => role,
            Err(_) => return "Unknown role".to_owned(),
        };

        match self.registry.register(name, id, role) {
            Ok(()) => "OK".to_owned(),
            Err(RegistryError::DuplicateName(_)) | Err(RegistryError::DuplicateId(_)) => {
                "Thread exists".to_owned()
            }
            Err(RegistryError::BadName) => "Bad name".to_owned(),
            Err(err) => {
                log::error!("register failed: {}", err);
                "Can't register thread".to_owned()
            }
        }
    }
}

/// Splits off the first whitespace-delimited word, returning it together
/// with the remainder (leading whitespace stripped, spacing inside the
/// remainder preserved).
fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start().trim_end_matches(['\r', '\n']);
    match s.find(char::is_whitespace) {
        Some(split) => (&s[..split], s[split..].trim_start()),
        None => (s, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver};
    use crate::frame::CanFrame;

    #[allow(clippy::type_complexity)]
    fn router() -> (
        Router,
        Receiver<CtrlMsg>,
        Receiver<String>,
        Receiver<CanFrame>,
    ) {
        let (b_tx, b_rx) = unbounded();
        let (o_tx, o_rx) = unbounded();
        let (c_tx, c_rx) = unbounded();
        let registry = Arc::new(Registry::new(b_tx.clone(), o_tx));
        (Router::new(registry, c_tx, b_tx), c_rx, b_rx, o_rx)
    }

    #[test]
    fn register_unregister_flow() {
        let (router, _c, _b, _o) = router();
        assert_eq!(router.process("register m1 0x200 raw"), Some("OK".into()));
        assert_eq!(
            router.process("register m1 0x201 raw"),
            Some("Thread exists".into())
        );
        assert_eq!(
            router.process("register m2 0x200 raw"),
            Some("Thread exists".into())
        );
        assert_eq!(
            router.process("register m3 0x900 raw"),
            Some("Wrong CANID".into())
        );
        assert_eq!(
            router.process("register m3 nine raw"),
            Some("Wrong CANID".into())
        );
        assert_eq!(
            router.process("register m3 0x300 turbine"),
            Some("Unknown role".into())
        );
        assert_eq!(router.process("unregister m1"), Some("OK".into()));
        assert_eq!(
            router.process("unregister m1"),
            Some("Thread not found".into())
        );
    }

    #[test]
    fn mesg_routes_payload_to_worker() {
        let (router, _c, _b, o_rx) = router();
        router.process("register m1 0x200 raw");

        assert_eq!(
            router.process("mesg m1 0x123 0x11 0x22 0x33"),
            Some("OK".into())
        );
        let frame = o_rx
            .recv_timeout(std::time::Duration::from_secs(2))
            .unwrap();
        assert_eq!(frame.raw_id(), 0x123);
        assert_eq!(frame.data(), &[0x11, 0x22, 0x33]);

        assert_eq!(
            router.process("mesg ghost 1 2"),
            Some("Thread not found".into())
        );
        assert_eq!(router.process("mesg m1"), Some("Wrong command".into()));
    }

    #[test]
    fn speed_validates_and_forwards() {
        let (router, c_rx, _b, _o) = router();
        assert_eq!(router.process("speed 500"), Some("OK".into()));
        assert!(matches!(c_rx.try_recv(), Ok(CtrlMsg::SetSpeed(500))));

        assert_eq!(router.process("speed 5"), Some("Wrong speed".into()));
        assert_eq!(router.process("speed 3001"), Some("Wrong speed".into()));
        assert_eq!(router.process("speed lots"), Some("Wrong speed".into()));
        assert!(c_rx.try_recv().is_err());

        // 0 is the documented "do not change" value
        assert_eq!(router.process("speed 0"), Some("OK".into()));
    }

    #[test]
    fn list_answers_over_the_broadcast_bus() {
        let (router, _c, b_rx, _o) = router();
        router.process("register m1 0x181 stepper");
        assert_eq!(router.process("list"), None);
        assert_eq!(b_rx.try_recv().unwrap(), "m1 0x181 stepper");
    }

    #[test]
    fn junk_is_rejected() {
        let (router, _c, _b, _o) = router();
        assert_eq!(router.process("frobnicate"), Some("Wrong command".into()));
        assert_eq!(router.process(""), None);
        assert_eq!(router.process("   \r\n"), None);
    }
}
