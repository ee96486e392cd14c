/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Snapshots of the SIO bus.
#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

#[cfg(feature = "snapshot")]
use serde::{Serialize, Deserialize};

use atarusty_core::clock::{Scheduler, Ticks};

use super::step::{Step, StepRecord};
use super::{is_disk_device, SioError, SioHost, SioInterfaceId, SioManager, MAX_TRANSFER_SIZE, EV_DELAY, EV_SEND};

/// A partially received command frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "snapshot", serde(rename_all = "camelCase"))]
pub struct SioManagerState {
    pub command_cycles_per_bit: u32,
    pub command_buffer_index: u8,
    pub command_buffer: [u8; 5],
}

/// A queued or current step together with the bytes it sends or has received so far.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "snapshot", serde(rename_all = "camelCase"))]
pub struct StepState {
    pub step: StepRecord,
    #[cfg_attr(feature = "snapshot", serde(with = "atarusty_core::memory::serde::bytes"))]
    pub transfer_data: Vec<u8>,
}

/// The command in progress on an interface.
///
/// Times are stored relative to the cycle the state was taken at.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "snapshot", serde(rename_all = "camelCase"))]
pub struct ActiveCommandState {
    pub device_id: u8,
    pub transfer_start_time: i64,
    pub transfer_index: u32,
    pub transfer_error: bool,
    pub transfer_cycles_per_bit: u32,
    pub transfer_cycles_per_byte: u32,
    pub transmit_synchronous: bool,
    pub current_step: Option<StepState>,
    pub step_delay: u32,
    pub steps: Vec<StepState>,
    pub queue_time: i64,
    pub queue_cycles_per_byte: u32,
    pub command_frame_end_time: i64,
    pub command_deassert_time: i64,
}

fn relative(t: Ticks, now: Ticks) -> i64 {
    t.wrapping_sub(now) as i64
}

fn absolute(offset: i64, now: Ticks) -> Ticks {
    now.wrapping_add(offset as Ticks)
}

impl SioManager {
    /// Returns the partially received command frame, if there is one.
    pub fn save_state(&self) -> Option<SioManagerState> {
        if !self.command_asserted && (self.command_buffer_index == 0 || self.command_buffer_index == 5) {
            return None
        }
        Some(SioManagerState {
            command_cycles_per_bit: self.command_cycles_per_bit,
            command_buffer_index: self.command_buffer_index as u8,
            command_buffer: self.command_buffer,
        })
    }
    /// Cancels all commands ahead of loading a snapshot.
    pub fn pre_load_state(&mut self, sched: &mut Scheduler) {
        self.cancel_all_commands(sched);
        self.loading_state = true;
        self.command_buffer_index = 0;
    }

    pub fn load_state(&mut self, state: Option<&SioManagerState>) -> Result<(), SioError> {
        if let Some(state) = state {
            if state.command_buffer_index > 5 {
                return Err(SioError::InvalidCommandFrame)
            }
            self.command_buffer_index = state.command_buffer_index as usize;
            self.command_cycles_per_bit = state.command_cycles_per_bit;
            self.command_buffer = state.command_buffer;
        }
        Ok(())
    }

    pub fn post_load_state(&mut self) {
        self.loading_state = false;
    }
    /// Captures the active command of an interface.
    pub fn save_active_command(&self, sched: &Scheduler, id: SioInterfaceId) -> Option<ActiveCommandState> {
        let iface = self.iface(id.0).filter(|i| i.command_active)?;
        let now = sched.now();
        let mut transfer_pos = iface.transfer_end;
        let current_step = iface.current.map(|step| {
            let transfer_data = match step {
                Step::Send {..} | Step::SendAuto {..} => {
                    iface.buffer[iface.transfer_start..iface.transfer_start + step.transfer_len() as usize].to_vec()
                }
                Step::Receive {..} | Step::ReceiveAuto {..} => {
                    iface.buffer[iface.transfer_start..iface.transfer_index].to_vec()
                }
                _ => Vec::new()
            };
            StepState { step: step.to_record(), transfer_data }
        });
        let steps = iface.steps.iter().map(|step| {
            let transfer_data = match step {
                Step::Send {..} | Step::SendAuto {..} => {
                    let len = step.transfer_len() as usize;
                    let data = iface.buffer[transfer_pos..transfer_pos + len].to_vec();
                    transfer_pos += len;
                    data
                }
                Step::Receive {..} | Step::ReceiveAuto {..} => {
                    transfer_pos += step.transfer_len() as usize;
                    Vec::new()
                }
                _ => Vec::new()
            };
            StepState { step: step.to_record(), transfer_data }
        }).collect();
        let step_delay = iface.transfer_event.or(iface.delay_event)
            .and_then(|ev| sched.ticks_to_event(ev))
            .unwrap_or(0) as u32;
        Some(ActiveCommandState {
            device_id: iface.active_device_id,
            transfer_start_time: if iface.receiving { relative(iface.transfer_start_time, now) } else { 0 },
            transfer_index: (iface.transfer_index - iface.transfer_start) as u32,
            transfer_error: iface.transfer_error,
            transfer_cycles_per_bit: iface.cycles_per_bit,
            transfer_cycles_per_byte: iface.cycles_per_byte,
            transmit_synchronous: iface.sync_transmit,
            current_step,
            step_delay,
            steps,
            queue_time: relative(iface.command_queue_time, now),
            queue_cycles_per_byte: iface.queue_cycles_per_byte,
            command_frame_end_time: relative(iface.command_frame_end_time, now),
            command_deassert_time: relative(iface.command_deassert_time, now),
        })
    }
    /// Restores the active command of an interface, replacing any command in progress.
    ///
    /// On error the interface is left idle.
    pub fn load_active_command(&mut self, sched: &mut Scheduler, host: &mut dyn SioHost,
                               id: SioInterfaceId, state: &ActiveCommandState) -> Result<(), SioError>
    {
        if self.iface(id.0).is_none() {
            return Err(SioError::UnknownInterface)
        }
        self.cancel_command(id.0, sched);
        let res = self.restore_active_command(sched, id.0, state);
        if let Some(iface) = self.iface_mut(id.0) {
            if res.is_err() {
                iface.drop_command();
                iface.reset_transfer_params();
            }
        }
        self.flush_dead_events(id.0, sched);
        if res.is_ok() {
            self.execute_next_step(id.0, sched, host, None);
        }
        res
    }

    fn restore_active_command(&mut self, sched: &mut Scheduler, idx: usize,
                              state: &ActiveCommandState) -> Result<(), SioError>
    {
        let owner = self.owner;
        let now = sched.now();
        let iface = match self.iface_mut(idx) {
            Some(iface) => iface,
            None => return Err(SioError::UnknownInterface)
        };
        iface.reset_transfer_params();
        if state.transfer_cycles_per_byte != 0 {
            iface.cycles_per_byte = state.transfer_cycles_per_byte;
        }
        if state.transfer_cycles_per_bit != 0 {
            iface.cycles_per_bit = state.transfer_cycles_per_bit;
        }
        iface.command_active = true;
        iface.active_device_id = state.device_id;
        iface.active_device_disk = is_disk_device(state.device_id);
        iface.sync_transmit = state.transmit_synchronous;
        iface.transfer_start = 0;
        iface.transfer_end = 0;
        iface.transfer_error = state.transfer_error;
        iface.transfer_send = false;
        iface.transfer_start_time = absolute(state.transfer_start_time, now);
        iface.command_queue_time = absolute(state.queue_time, now);
        iface.queue_cycles_per_byte = state.queue_cycles_per_byte;
        iface.command_frame_end_time = absolute(state.command_frame_end_time, now);
        iface.command_deassert_time = absolute(state.command_deassert_time, now);
        iface.buffer.clear();

        if let Some(cur) = &state.current_step {
            let step = Step::from_record(&cur.step)?;
            let len = step.transfer_len() as usize;
            if len > MAX_TRANSFER_SIZE {
                return Err(SioError::InvalidTransferIndex)
            }
            iface.current = Some(step);
            match step {
                Step::Receive {..} | Step::ReceiveAuto {..} => {
                    if cur.transfer_data.len() > len {
                        return Err(SioError::InvalidTransferData)
                    }
                    iface.buffer.extend_from_slice(&cur.transfer_data);
                    iface.buffer.resize(len, 0);
                    iface.transfer_end = len;
                    iface.receiving = true;
                }
                Step::Send {..} | Step::SendAuto {..} => {
                    if cur.transfer_data.len() != len {
                        return Err(SioError::InvalidTransferData)
                    }
                    iface.buffer.extend_from_slice(&cur.transfer_data);
                    iface.transfer_end = len;
                    iface.transfer_send = true;
                    iface.sending = true;
                    if state.step_delay != 0 {
                        sched.set_event(state.step_delay as Ticks, owner,
                                        Self::event_id(idx, EV_SEND), &mut iface.transfer_event);
                    }
                }
                Step::Delay(..) => {
                    if state.step_delay != 0 {
                        sched.set_event(state.step_delay as Ticks, owner,
                                        Self::event_id(idx, EV_DELAY), &mut iface.delay_event);
                    }
                }
                _ => {}
            }
        }

        iface.transfer_index = state.transfer_index as usize;
        if iface.transfer_index > iface.transfer_end {
            return Err(SioError::InvalidTransferIndex)
        }

        for saved in state.steps.iter() {
            let step = Step::from_record(&saved.step)?;
            match step {
                Step::Send {..} | Step::SendAuto {..} => {
                    if saved.transfer_data.len() != step.transfer_len() as usize {
                        return Err(SioError::InvalidTransferData)
                    }
                    iface.buffer.extend_from_slice(&saved.transfer_data);
                }
                Step::Receive {..} | Step::ReceiveAuto {..} => {
                    let new_len = iface.buffer.len() + step.transfer_len() as usize;
                    iface.buffer.resize(new_len, 0);
                }
                _ => {}
            }
            if iface.buffer.len() > MAX_TRANSFER_SIZE {
                return Err(SioError::InvalidTransferIndex)
            }
            iface.steps.push_back(step);
        }

        if iface.cycles_per_bit > 100_000 || iface.cycles_per_byte > 1_000_000 {
            return Err(SioError::InvalidTransferRate)
        }
        if iface.cycles_per_byte < iface.cycles_per_bit * 8 {
            return Err(SioError::InvalidTransferRate)
        }
        iface.update_receive_window();
        Ok(())
    }
}
