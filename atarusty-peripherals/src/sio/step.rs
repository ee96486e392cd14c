/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
use core::fmt;

#[cfg(feature = "snapshot")]
use serde::{Serialize, Deserialize};

use super::SioError;

/// A single queued operation of an SIO interface.
///
/// Steps are executed strictly in order, one at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Waits the given number of cycles.
    Delay(u32),
    /// Sends `len` bytes from the transfer buffer.
    Send { len: u32 },
    /// Like `Send`, but the last byte is a checksum synthesized by the interface.
    SendAuto { len: u32 },
    /// Opens a receive window of `len` bytes. `id` is reported back on completion.
    Receive { len: u32, id: u32 },
    /// Like `Receive`, the last byte is a checksum validated by the interface.
    ReceiveAuto { len: u32, id: u32 },
    SetTransferRate { cycles_per_bit: u32, cycles_per_byte: u32 },
    SetSynchronousTransmit(bool),
    /// Notifies the device when reached.
    Fence(u32),
    EndCommand,
    AccelSendAck,
    AccelSendNak,
    AccelSendComplete,
    AccelSendError,
}

impl Step {
    /// Returns the number of transfer buffer bytes this step consumes.
    pub fn transfer_len(&self) -> u32 {
        match *self {
            Step::Send { len } | Step::SendAuto { len } |
            Step::Receive { len, .. } | Step::ReceiveAuto { len, .. } => len,
            _ => 0
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Step::Delay(..) => "delay",
            Step::Send {..} => "send",
            Step::SendAuto {..} => "send_auto",
            Step::Receive {..} => "receive",
            Step::ReceiveAuto {..} => "receive_auto",
            Step::SetTransferRate {..} => "set_transfer_rate",
            Step::SetSynchronousTransmit(..) => "set_sync_transmit",
            Step::Fence(..) => "fence",
            Step::EndCommand => "end_command",
            Step::AccelSendAck => "accel_send_ack",
            Step::AccelSendNak => "accel_send_nak",
            Step::AccelSendComplete => "accel_send_complete",
            Step::AccelSendError => "accel_send_error",
        }
    }
    /// Splits a step into its serializable name and arguments.
    pub fn to_record(&self) -> StepRecord {
        let (arg1, arg2) = match *self {
            Step::Delay(ticks) => (ticks, 0),
            Step::Send { len } | Step::SendAuto { len } => (len, 0),
            Step::Receive { len, id } | Step::ReceiveAuto { len, id } => (len, id),
            Step::SetTransferRate { cycles_per_bit, cycles_per_byte } => (cycles_per_bit, cycles_per_byte),
            Step::SetSynchronousTransmit(sync) => (sync as u32, 0),
            Step::Fence(id) => (id, 0),
            _ => (0, 0)
        };
        StepRecord { step_type: self.name().into(), arg1, arg2 }
    }
    /// Rebuilds a step from a record.
    pub fn from_record(rec: &StepRecord) -> Result<Step, SioError> {
        let StepRecord { arg1, arg2, .. } = *rec;
        Ok(match rec.step_type.as_str() {
            "delay" => Step::Delay(arg1),
            "send" => Step::Send { len: arg1 },
            "send_auto" => Step::SendAuto { len: arg1 },
            "receive" => Step::Receive { len: arg1, id: arg2 },
            "receive_auto" => Step::ReceiveAuto { len: arg1, id: arg2 },
            "set_transfer_rate" => {
                if arg1 == 0 || arg2 == 0 {
                    return Err(SioError::InvalidTransferRate)
                }
                Step::SetTransferRate { cycles_per_bit: arg1, cycles_per_byte: arg2 }
            }
            "set_sync_transmit" => Step::SetSynchronousTransmit(arg1 != 0),
            "fence" => Step::Fence(arg1),
            "end_command" => Step::EndCommand,
            "accel_send_ack" => Step::AccelSendAck,
            "accel_send_nak" => Step::AccelSendNak,
            "accel_send_complete" => Step::AccelSendComplete,
            "accel_send_error" => Step::AccelSendError,
            other => return Err(SioError::UnknownStep(other.into()))
        })
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rec = self.to_record();
        write!(f, "{}({}, {})", rec.step_type, rec.arg1, rec.arg2)
    }
}

/// A serialized form of [Step].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "snapshot", serde(rename_all = "camelCase"))]
pub struct StepRecord {
    pub step_type: String,
    pub arg1: u32,
    pub arg2: u32,
}
