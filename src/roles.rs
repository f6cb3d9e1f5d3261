//! Worker behaviours: the role table and the loops behind `raw`, `canopen`
//! and `emulation` workers. The `stepper` behaviour lives in its own module.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crossbeam_channel::TryRecvError;
use embedded_can::StandardId;

use crate::frame::CanFrame;
use crate::registry::WorkerCtx;
use crate::sdo::{Ccs, Sdo};
use crate::stepper::Stepper;
use crate::util::parse_long;

/// Back-off sleep of an idle worker iteration
pub const WORKER_TICK: Duration = Duration::from_millis(1);

#[derive(Debug, thiserror::Error)]
#[error("unknown worker role {0:?}")]
pub struct UnknownRole(String);

/// The set of behaviours a worker can be registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Raw,
    Canopen,
    Stepper,
    Emulation,
}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(Role::Raw),
            "canopen" => Ok(Role::Canopen),
            "stepper" => Ok(Role::Stepper),
            "emulation" => Ok(Role::Emulation),
            _ => Err(UnknownRole(s.to_owned())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Raw => "raw",
            Role::Canopen => "canopen",
            Role::Stepper => "stepper",
            Role::Emulation => "emulation",
        })
    }
}

impl Role {
    /// Runs the behaviour loop until the registry requests shutdown.
    pub fn run(self, ctx: WorkerCtx) {
        match self {
            Role::Raw => worker_loop(ctx, &mut Raw),
            Role::Canopen => worker_loop(ctx, &mut Canopen),
            Role::Stepper => worker_loop(ctx, &mut Stepper::default()),
            Role::Emulation => worker_loop(ctx, &mut Emulation),
        }
    }
}

/// One worker behaviour: consumes commands, consumes answer frames, emits
/// outbound frames and broadcast lines through the context.
pub trait Behaviour {
    fn on_command(&mut self, ctx: &WorkerCtx, command: &str);
    fn on_answer(&mut self, ctx: &WorkerCtx, frame: CanFrame);
}

/// The cooperative loop shared by all behaviours: a shutdown check at the
/// top of every iteration, one command and one answer per pass, 1 ms
/// back-off when both queues were empty.
pub fn worker_loop(ctx: WorkerCtx, behaviour: &mut dyn Behaviour) {
    while !ctx.shutdown.load(Ordering::Relaxed) {
        let mut idle = true;

        match ctx.commands.try_recv() {
            Ok(command) => {
                idle = false;
                behaviour.on_command(&ctx, &command);
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return,
        }

        match ctx.answers.try_recv() {
            Ok(frame) => {
                idle = false;
                behaviour.on_answer(&ctx, frame);
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return,
        }

        if idle {
            std::thread::sleep(WORKER_TICK);
        }
    }
}

/// Splits a command payload into numeric tokens. Delimiters match the wire
/// protocol: spaces, tabs, commas and semicolons.
pub(crate) fn numeric_tokens(text: &str) -> Option<Vec<i64>> {
    text.split([' ', '\t', ',', ';'])
        .filter(|t| !t.is_empty())
        .map(parse_long)
        .collect()
}

/// `raw` - transmit arbitrary frames and report everything received.
///
/// Command format: `ID [d0 … d7]`, numbers in decimal, hex or octal.
pub struct Raw;

impl Behaviour for Raw {
    fn on_command(&mut self, ctx: &WorkerCtx, command: &str) {
        let Some(values) = numeric_tokens(command) else {
            log::warn!("worker {:?}: unparsable command {:?}", ctx.name, command);
            return;
        };
        if values.is_empty() || values.len() > 9 {
            log::warn!("worker {:?}: bad token count in {:?}", ctx.name, command);
            return;
        }

        let id = match u16::try_from(values[0]).ok().and_then(StandardId::new) {
            Some(id) => id,
            None => {
                log::warn!("worker {:?}: CAN ID {} out of range", ctx.name, values[0]);
                return;
            }
        };
        let mut data = [0u8; 8];
        for (slot, value) in data.iter_mut().zip(&values[1..]) {
            match u8::try_from(*value) {
                Ok(byte) => *slot = byte,
                Err(_) => {
                    log::warn!("worker {:?}: data byte {} out of range", ctx.name, value);
                    return;
                }
            }
        }

        // length checked above, so the constructor cannot fail
        ctx.send_frame(CanFrame::new(id, &data[..values.len() - 1]).unwrap());
    }

    fn on_answer(&mut self, ctx: &WorkerCtx, frame: CanFrame) {
        ctx.post(frame.to_broadcast_line());
    }
}

/// `canopen` - raw expedited SDO exchanges with any node.
///
/// Command format: `NodeID index subindex [d0 … d3]`; exactly three tokens
/// form a read request, additional bytes form a write.
pub struct Canopen;

impl Behaviour for Canopen {
    fn on_command(&mut self, ctx: &WorkerCtx, command: &str) {
        let Some(values) = numeric_tokens(command) else {
            log::warn!("worker {:?}: unparsable command {:?}", ctx.name, command);
            return;
        };
        if !(3..=7).contains(&values.len()) {
            log::warn!("worker {:?}: bad CANopen command {:?}", ctx.name, command);
            return;
        }

        let (node_id, index, subindex) = match (
            u8::try_from(values[0]).ok().filter(|n| *n <= 127),
            u16::try_from(values[1]).ok(),
            u8::try_from(values[2]).ok(),
        ) {
            (Some(n), Some(i), Some(s)) => (n, i, s),
            _ => {
                log::warn!("worker {:?}: bad CANopen address in {:?}", ctx.name, command);
                return;
            }
        };

        let mut data = [0u8; 4];
        for (slot, value) in data.iter_mut().zip(&values[3..]) {
            match u8::try_from(*value) {
                Ok(byte) => *slot = byte,
                Err(_) => {
                    log::warn!("worker {:?}: data byte {} out of range", ctx.name, value);
                    return;
                }
            }
        }
        let datalen = (values.len() - 3) as u8;

        let sdo = Sdo {
            node_id,
            // no payload means a read request
            ccs: if datalen == 0 {
                Ccs::InitUpload
            } else {
                Ccs::InitDownload
            },
            index,
            subindex,
            data,
            datalen,
        };
        ctx.send_frame(sdo.to_frame());
    }

    fn on_answer(&mut self, ctx: &WorkerCtx, frame: CanFrame) {
        if let Some(sdo) = Sdo::from_frame(&frame) {
            ctx.post(format!("{} {}", ctx.name, sdo.to_broadcast_line()));
        }
    }
}

/// `emulation` - a stub behaviour for exercising the dispatch plumbing
/// without hardware: commands are echoed to all clients, answers discarded.
pub struct Emulation;

impl Behaviour for Emulation {
    fn on_command(&mut self, ctx: &WorkerCtx, command: &str) {
        ctx.post(format!("{} {}", ctx.name, command));
    }

    fn on_answer(&mut self, _ctx: &WorkerCtx, _frame: CanFrame) {}
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    pub(crate) fn test_ctx(
        name: &str,
        id: u16,
    ) -> (WorkerCtx, Receiver<String>, Receiver<CanFrame>) {
        // the command/answer senders are dropped on purpose: behaviour tests
        // feed the handlers directly
        let (_cmd_tx, cmd_rx) = unbounded();
        let (_ans_tx, ans_rx) = unbounded();
        let (b_tx, b_rx) = unbounded();
        let (o_tx, o_rx) = unbounded();
        let ctx = WorkerCtx {
            name: name.to_owned(),
            id,
            commands: cmd_rx,
            answers: ans_rx,
            broadcast: b_tx,
            outbound: o_tx,
            shutdown: Arc::new(AtomicBool::new(false)),
        };
        (ctx, b_rx, o_rx)
    }

    #[test]
    fn role_names_round_trip() {
        for role in [Role::Raw, Role::Canopen, Role::Stepper, Role::Emulation] {
            assert_eq!(role.to_string().parse::<Role>().unwrap(), role);
        }
        assert!("turbo".parse::<Role>().is_err());
        assert_eq!("RAW".parse::<Role>().unwrap(), Role::Raw);
    }

    #[test]
    fn raw_command_builds_outbound_frame() {
        let (ctx, _b, o_rx) = test_ctx("m1", 0x200);
        Raw.on_command(&ctx, "0x123 0x11 0x22 0x33");

        let frame = o_rx.try_recv().unwrap();
        assert_eq!(frame.raw_id(), 0x123);
        assert_eq!(frame.data(), &[0x11, 0x22, 0x33]);
    }

    #[test]
    fn raw_command_rejects_garbage() {
        let (ctx, _b, o_rx) = test_ctx("m1", 0x200);
        Raw.on_command(&ctx, "");
        Raw.on_command(&ctx, "banana");
        Raw.on_command(&ctx, "0x800 1"); // id out of range
        Raw.on_command(&ctx, "0x100 256"); // byte out of range
        Raw.on_command(&ctx, "1 2 3 4 5 6 7 8 9 10"); // more than 8 data bytes
        assert!(o_rx.try_recv().is_err());
    }

    #[test]
    fn raw_answer_is_republished_for_clients() {
        let (ctx, b_rx, _o) = test_ctx("m1", 0x200);
        let frame = CanFrame::new(StandardId::new(0x123).unwrap(), &[0x11, 0x22, 0x33]).unwrap();
        Raw.on_answer(&ctx, frame);
        assert_eq!(b_rx.try_recv().unwrap(), "#0x123 0x11 0x22 0x33");
    }

    #[test]
    fn canopen_read_request_uses_initiate_upload() {
        let (ctx, _b, o_rx) = test_ctx("m2", 0x581);
        Canopen.on_command(&ctx, "1 0x6041 0");

        let frame = o_rx.try_recv().unwrap();
        assert_eq!(frame.raw_id(), 0x601);
        assert_eq!(frame.data()[0], 0x40); // InitUpload, no size bits
        assert_eq!(frame.data()[1], 0x41);
        assert_eq!(frame.data()[2], 0x60);
    }

    #[test]
    fn canopen_write_request_carries_payload() {
        let (ctx, _b, o_rx) = test_ctx("m2", 0x581);
        Canopen.on_command(&ctx, "2 0x6002 0 1");

        let frame = o_rx.try_recv().unwrap();
        assert_eq!(frame.raw_id(), 0x602);
        // InitDownload, 1 byte, expedited with size
        assert_eq!(frame.data()[0], (1 << 5) | (3 << 2) | 0b11);
        assert_eq!(frame.data()[4], 1);
    }

    #[test]
    fn canopen_answer_renders_sdo_line() {
        let (ctx, b_rx, _o) = test_ctx("m2", 0x581);
        let frame = CanFrame::new(
            StandardId::new(0x581).unwrap(),
            &[0x4B, 0x41, 0x60, 0x00, 0x37, 0x02, 0x00, 0x00],
        )
        .unwrap();
        Canopen.on_answer(&ctx, frame);
        assert_eq!(
            b_rx.try_recv().unwrap(),
            "m2 nid=0x01, idx=0x6041, subidx=0, ccs=0x02, datalen=2, data=[0x37, 0x02]"
        );
    }

    #[test]
    fn canopen_ignores_non_sdo_traffic() {
        let (ctx, b_rx, _o) = test_ctx("m2", 0x581);
        let frame = CanFrame::new(StandardId::new(0x181).unwrap(), &[1, 2]).unwrap();
        Canopen.on_answer(&ctx, frame);
        assert!(b_rx.try_recv().is_err());
    }
}
