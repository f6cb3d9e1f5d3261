//! The `stepper` behaviour: a command vocabulary for one stepper controller
//! node, mapped onto object-dictionary reads and writes.
//!
//! The node ID is taken from the low seven bits of the worker's registry ID,
//! so a worker registered at 0x581 talks to node 1.

use crate::dict::{self, DictEntry};
use crate::registry::WorkerCtx;
use crate::roles::{numeric_tokens, Behaviour};
use crate::sdo::{abort_text, Sdo, SdoValue};
use crate::frame::CanFrame;

/// MAXSPEED limits of the controller
const MAX_SPEED_MIN: i64 = -200_000;
const MAX_SPEED_MAX: i64 = 200_000;

struct StepperCommand {
    name: &'static str,
    nargs: usize,
    help: &'static str,
}

static COMMANDS: [StepperCommand; 9] = [
    StepperCommand {
        name: "help",
        nargs: 0,
        help: "list supported commands",
    },
    StepperCommand {
        name: "stop",
        nargs: 0,
        help: "stop motion and clear the latched status",
    },
    StepperCommand {
        name: "status",
        nargs: 0,
        help: "report device status, position and error state",
    },
    StepperCommand {
        name: "relmove",
        nargs: 1,
        help: "move by the given number of steps (sign selects direction)",
    },
    StepperCommand {
        name: "absmove",
        nargs: 1,
        help: "move to the given absolute position",
    },
    StepperCommand {
        name: "enable",
        nargs: 1,
        help: "enable (1) or disable (0) the motor driver",
    },
    StepperCommand {
        name: "setzero",
        nargs: 0,
        help: "declare the current position to be zero",
    },
    StepperCommand {
        name: "maxspeed",
        nargs: 1,
        help: "set the maximal speed",
    },
    StepperCommand {
        name: "info",
        nargs: 0,
        help: "read out the main controller registers",
    },
];

/// Registers read by `info`, in request order.
static INFO_ENTRIES: [&DictEntry; 11] = [
    &dict::DEVSTATUS,
    &dict::ERRSTATE,
    &dict::POSITION,
    &dict::MAXSPEED,
    &dict::OPMODE,
    &dict::MICROSTEPS,
    &dict::MAXCURNT,
    &dict::STARTSPEED,
    &dict::STOPSPEED,
    &dict::ACCELCOEF,
    &dict::DECELCOEF,
];

/// Per-worker stepper state.
#[derive(Default)]
pub struct Stepper {
    /// While non-zero, received DEVSTATUS/ERRSTATE values are written back
    /// verbatim to acknowledge and clear the latched bits after `stop`.
    clear_pending: u8,
}

impl Stepper {
    fn read(&self, ctx: &WorkerCtx, entry: &DictEntry) {
        ctx.send_frame(Sdo::read_request(entry, ctx.node_id()).to_frame());
    }

    fn write(&self, ctx: &WorkerCtx, entry: &DictEntry, value: i64) {
        ctx.send_frame(Sdo::write_request(entry, ctx.node_id(), value).to_frame());
    }

    fn report_status_bits(&self, ctx: &WorkerCtx, entry: &DictEntry, value: i64) {
        let byte = value as u8;
        for bit in 0..8 {
            let name = if entry == &dict::DEVSTATUS {
                dict::status_bit_name(byte, bit)
            } else {
                dict::error_bit_name(byte, bit)
            };
            if let Some(name) = name {
                ctx.post(format!("{} {}: {}", ctx.name, entry.name, name));
            }
        }
    }
}

impl Behaviour for Stepper {
    fn on_command(&mut self, ctx: &WorkerCtx, command: &str) {
        let text = command.trim();
        let (verb, rest) = match text.find(char::is_whitespace) {
            Some(split) => (&text[..split], &text[split..]),
            None => (text, ""),
        };

        let Some(cmd) = COMMANDS
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(verb))
        else {
            ctx.post(format!("{} wrong command '{}'", ctx.name, verb));
            return;
        };
        let args = match numeric_tokens(rest) {
            Some(args) if args.len() == cmd.nargs => args,
            _ => {
                ctx.post(format!(
                    "{} {} needs {} argument(s)",
                    ctx.name, cmd.name, cmd.nargs
                ));
                return;
            }
        };

        match cmd.name {
            "help" => {
                for command in &COMMANDS {
                    ctx.post(format!("{} {} - {}", ctx.name, command.name, command.help));
                }
            }
            "stop" => {
                self.write(ctx, &dict::STOP, 1);
                self.read(ctx, &dict::DEVSTATUS);
                self.read(ctx, &dict::ERRSTATE);
                // the controller latches its state words; writing the read
                // values back acknowledges and clears them
                self.clear_pending = 2;
            }
            "status" => {
                self.read(ctx, &dict::DEVSTATUS);
                self.read(ctx, &dict::POSITION);
                self.read(ctx, &dict::ERRSTATE);
            }
            "relmove" => {
                let steps = args[0];
                self.write(ctx, &dict::ROTDIR, i64::from(steps > 0));
                self.write(ctx, &dict::RELSTEPS, steps.abs());
            }
            "absmove" => self.write(ctx, &dict::ABSSTEPS, args[0]),
            "enable" => self.write(ctx, &dict::ENABLE, i64::from(args[0] != 0)),
            "setzero" => self.write(ctx, &dict::POSITION, 0),
            "maxspeed" => {
                let speed = args[0];
                if !(MAX_SPEED_MIN..=MAX_SPEED_MAX).contains(&speed) {
                    ctx.post(format!("{} maxspeed {} is out of range", ctx.name, speed));
                    return;
                }
                self.write(ctx, &dict::MAXSPEED, speed);
            }
            "info" => {
                for entry in INFO_ENTRIES {
                    self.read(ctx, entry);
                }
            }
            _ => unreachable!(),
        }
    }

    fn on_answer(&mut self, ctx: &WorkerCtx, frame: CanFrame) {
        let Some(sdo) = Sdo::from_frame(&frame) else {
            return;
        };
        let Some(entry) = dict::find(sdo.index, sdo.subindex) else {
            // answers outside the dictionary are still worth reporting
            ctx.post(format!("{} {}", ctx.name, sdo.to_broadcast_line()));
            return;
        };

        match sdo.value_of(entry) {
            SdoValue::Acked => ctx.post(format!("{} {}=OK", ctx.name, entry.name)),
            SdoValue::Abort(code) => {
                let text = abort_text(code).unwrap_or("unknown abort code");
                log::warn!("worker {:?}: SDO abort 0x{:08X} ({})", ctx.name, code, text);
                ctx.post(format!(
                    "{} abortcode='0x{:08X}' error='{}'",
                    ctx.name, code, text
                ));
            }
            SdoValue::Value(value) => {
                ctx.post(format!("{} {}={}", ctx.name, entry.name, value));
                if entry == &dict::DEVSTATUS || entry == &dict::ERRSTATE {
                    self.report_status_bits(ctx, entry, value);
                    if self.clear_pending > 0 {
                        self.write(ctx, entry, value);
                        self.clear_pending -= 1;
                    }
                }
            }
        }
    }
}
