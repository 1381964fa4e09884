//! Command decode and the resumable phase machine.
//!
//! The controller parks on a [`Phase`] label between port accesses. A
//! qualifying data-port access enters [`Upd765a::run`], which executes
//! continuations until the machine needs another byte from the host (a
//! receive or send engine suspension) or a command completes. The label
//! set is flat: one level of stored return labels covers the
//! receive/send engines and the per-sector transfer loops, so no call
//! stack survives across port accesses.
//!
//! Command bytes dispatch on their low 5 bits; bit 5 is SK (skip a
//! sector whose data address mark does not match), bits 6-7 (MF/MT) are
//! accepted and ignored.

use format_dsk::{OFF_SECTOR_DATA, OFF_SECTOR_INFO_LIST, SECTOR_INFO_LEN, SectorInfo};

use crate::{
    MSR_CB, MSR_DIO, MSR_EXM, MSR_RQM, RandomMethod, ST0_ABNORMAL, ST0_HEAD, ST0_INVALID,
    ST0_NOT_READY, ST0_SEEK_END, ST1_DATA_ERROR, ST1_END_OF_CYLINDER, ST1_MISSING_AM, ST1_NO_DATA,
    ST1_NOT_WRITABLE, ST2_BAD_CYLINDER, ST2_CONTROL_MARK, ST2_DATA_ERROR,
    ST2_MISSING_DAM, ST2_WRONG_CYLINDER, ST3_HEAD, ST3_READY, ST3_TRACK0, ST3_WRITE_PROTECT,
    Upd765a,
};

const CMD_READ_TRACK: u8 = 0x02;
const CMD_SPECIFY: u8 = 0x03;
const CMD_SENSE_DRIVE: u8 = 0x04;
const CMD_WRITE_DATA: u8 = 0x05;
const CMD_READ_DATA: u8 = 0x06;
const CMD_RECALIBRATE: u8 = 0x07;
const CMD_SENSE_INTERRUPT: u8 = 0x08;
const CMD_WRITE_DELETED_DATA: u8 = 0x09;
const CMD_READ_ID: u8 = 0x0A;
const CMD_READ_DELETED_DATA: u8 = 0x0C;
const CMD_FORMAT_TRACK: u8 = 0x0D;
const CMD_SEEK: u8 = 0x0F;
const CMD_VERSION: u8 = 0x10;
const CMD_SCAN_EQUAL: u8 = 0x11;
const CMD_SCAN_LOW_OR_EQUAL: u8 = 0x19;
const CMD_SCAN_HIGH_OR_EQUAL: u8 = 0x1D;

/// SK bit of the command byte.
const CMD_SKIP_FLAG: u8 = 0x20;

/// ST1 bits that mark a sector unreadable: DE, ND, MA.
const ST1_ERROR_BITS: u8 = ST1_DATA_ERROR | ST1_NO_DATA | ST1_MISSING_AM;
/// ST2 bits that mark a sector unreadable: DD, MD.
const ST2_ERROR_BITS: u8 = ST2_DATA_ERROR | ST2_MISSING_DAM;

/// Status polls the host gets per data byte before the transfer is
/// declared lost.
const OVERRUN_POLL_BUDGET: u8 = 64;

/// First 8 data bytes of sectors whose loaders verify the FIRST byte of
/// a damaged sector changes between reads; everything else gets the
/// final byte corrupted. Dixon's Premiere Collection, disk 1.
const DIXONS_PREMIERE_1: [u32; 2] = [0x1CE2_AE94, 0x80A4_0824];
/// Dixon's Premiere Collection, disk 2.
const DIXONS_PREMIERE_2: [u32; 2] = [0xAAC6_F5B5, 0x2A04_1840];
/// Hopping Mad.
const HOPPING_MAD: [u32; 2] = [0x9283_1270, 0x0913_4D31];

/// Continuation labels of the phase machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Idle; the next data-port write is a command byte.
    AwaitCommand,
    /// Receive engine: one CPU→FDC byte per data-port write.
    ReceiveByte,
    /// Send engine: one FDC→CPU byte per data-port read.
    SendByte,

    /// Parameter bytes for a read command are in.
    ReadParamsDone,
    /// Parameter bytes for a write command are in.
    WriteParamsDone,
    ReadIdParamsDone,
    RecalibrateParamsDone,
    SeekParamsDone,
    SpecifyParamsDone,
    SenseDriveParamsDone,

    /// A sector finished streaming to the CPU.
    SectorToCpuDone,
    /// A sector finished arriving from the CPU.
    CpuToSectorDone,
    /// Post-transfer bookkeeping of the read path: errors, EOT, next R.
    AfterSectorRead,
    /// Post-transfer of a sector served despite a mark mismatch or
    /// recorded errors: flag end-of-cylinder and produce results.
    AfterDamMismatch,
    /// The write path looks for further sectors in the R..EOT range.
    WriteNextSector,
    /// The 7 sector-command result bytes went out.
    ResultsSent,

    /// Command over: back to idle.
    CommandDone,
    /// Sense Drive Status epilogue (extra ST0 masking).
    SenseDriveDone,
}

/// Which read command is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadMode {
    Data,
    DeletedData,
    Track,
}

/// Which write command is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    Data,
    DeletedData,
}

/// Destination of the receive engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecvTarget {
    /// The command parameter buffer.
    Params,
    /// The selected unit's scratch track block.
    TrackData,
}

/// Source of the send engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendSource {
    /// The command result buffer.
    Results,
    /// The selected unit's scratch track block.
    TrackData,
    /// The bad-sector randomization buffer.
    RandomBuf,
}

impl Upd765a {
    /// Execute continuations starting at `entry` until the machine
    /// suspends for the next byte or returns to idle.
    pub(crate) fn run(&mut self, entry: Phase) {
        let mut phase = entry;
        loop {
            match phase {
                Phase::AwaitCommand => {
                    self.dispatch_command();
                    return;
                }

                Phase::ReceiveByte => {
                    let value = self.data_latch;
                    match self.rcv_target {
                        RecvTarget::Params => {
                            if let Some(slot) = self.params.get_mut(self.rcv_off) {
                                *slot = value;
                            }
                        }
                        RecvTarget::TrackData => {
                            let offset = self.rcv_off;
                            self.unit_mut().track.set_byte(offset, value);
                        }
                    }
                    self.rcv_off += 1;
                    self.rcv_count -= 1;
                    if self.rcv_count > 0 {
                        return;
                    }
                    let next = self.return_after_transfer;
                    self.phase = next;
                    phase = next;
                }

                Phase::SendByte => {
                    self.data_latch = match self.send_source {
                        SendSource::Results => {
                            self.results.get(self.send_off).copied().unwrap_or(0)
                        }
                        SendSource::TrackData => self.unit().track.byte(self.send_off),
                        SendSource::RandomBuf => {
                            self.random_buf.get(self.send_off).copied().unwrap_or(0)
                        }
                    };
                    self.send_off += 1;
                    self.send_count -= 1;
                    if self.send_count > 0 {
                        self.overrun_test = true;
                        self.overrun_counter = OVERRUN_POLL_BUDGET;
                        return;
                    }
                    let next = self.return_after_transfer;
                    self.phase = next;
                    phase = next;
                }

                Phase::ReadParamsDone => {
                    self.command_callback(9);
                    self.original_r = self.params[3];
                    self.buffer_return = Phase::CommandDone;
                    let Some(next) = self.begin_sector_read() else {
                        return;
                    };
                    phase = next;
                }

                Phase::WriteParamsDone => {
                    self.command_callback(9);
                    self.original_r = self.params[3];
                    self.buffer_return = Phase::CommandDone;
                    let Some(next) = self.begin_sector_write() else {
                        return;
                    };
                    phase = next;
                }

                Phase::ReadIdParamsDone => {
                    self.read_sector_id();
                    return;
                }

                Phase::RecalibrateParamsDone => {
                    self.command_callback(2);
                    let unit_index = usize::from(self.params[0] & 1);
                    self.seek_unit = Some(unit_index);
                    self.units[unit_index].ctk = 0;
                    self.st3 |= ST3_TRACK0;
                    self.st0 = (self.st0 & 0x3F) | ST0_SEEK_END;
                    self.seek_result = ST0_SEEK_END;
                    self.units[unit_index].seek_done = true;
                    self.init_fdc();
                    return;
                }

                Phase::SeekParamsDone => {
                    self.command_callback(3);
                    self.seek_result = ST0_SEEK_END;
                    let unit_index = usize::from(self.params[0] & 1);
                    self.seek_unit = Some(unit_index);
                    let num_tracks = self.units[unit_index].disk_info.num_tracks();
                    let mut cylinder = self.params[1];
                    if cylinder >= num_tracks {
                        // Seeking past the end stops on the last cylinder.
                        self.seek_result = ST0_ABNORMAL | ST0_SEEK_END;
                        cylinder = num_tracks.wrapping_sub(1);
                    }
                    self.units[unit_index].ctk = cylinder;
                    self.units[unit_index].csr = 0;
                    self.st0 = (self.st0 & 0x1B)
                        | ST0_SEEK_END
                        | (self.units[unit_index].chead << 2);
                    self.units[unit_index].seek_done = true;
                    self.init_fdc();
                    return;
                }

                Phase::SpecifyParamsDone => {
                    // SRT/HUT/HLT timings have no effect at this level.
                    self.command_callback(3);
                    self.st0 &= 0x3F;
                    self.init_fdc();
                    return;
                }

                Phase::SenseDriveParamsDone => {
                    self.sense_drive_status();
                    return;
                }

                Phase::SectorToCpuDone => {
                    self.sectors_transferred = self.sectors_transferred.wrapping_add(1);
                    phase = self.sector_read_return;
                }

                Phase::CpuToSectorDone => {
                    self.unit_mut().store_track();
                    phase = self.sector_write_return;
                }

                Phase::AfterSectorRead => {
                    if self.main_status & MSR_EXM == 0 {
                        // The overrun watchdog tore the execution phase
                        // down mid-transfer.
                        self.return_sector_rw_results();
                        return;
                    }
                    if self.st1 & ST1_ERROR_BITS != 0 || self.st2 & ST2_ERROR_BITS != 0 {
                        self.st0 = ST0_ABNORMAL;
                        self.st1 |= ST1_END_OF_CYLINDER;
                        if self.read_mode != ReadMode::Track {
                            self.return_sector_rw_results();
                            return;
                        }
                    }
                    let info = self.unit().track.sector_info_at(self.current_info);
                    if self.read_mode == ReadMode::Track {
                        let num_sectors = self.unit().track.num_sectors();
                        if self.sectors_read == self.params[5]
                            || self.sectors_read >= num_sectors
                        {
                            self.read_complete(info);
                            return;
                        }
                    } else if info.r == self.params[5] {
                        self.read_complete(info);
                        return;
                    }
                    // More sectors wanted: bump R and search again from
                    // the next physical sector, fresh revolution budget.
                    self.params[3] = self.params[3].wrapping_add(1);
                    self.index_hole_count = 0;
                    let Some(next) = self.locate_and_transfer() else {
                        return;
                    };
                    phase = next;
                }

                Phase::AfterDamMismatch => {
                    self.st1 |= ST1_END_OF_CYLINDER;
                    self.return_sector_rw_results();
                    return;
                }

                Phase::WriteNextSector => {
                    if self.params[4] == 0 {
                        // N = 0 writes exactly one DTL-sized sector.
                        self.return_sector_rw_results();
                        return;
                    }
                    if !self.write_advance() {
                        self.return_sector_rw_results();
                        return;
                    }
                    let Some(next) = self.write_locate() else {
                        return;
                    };
                    phase = next;
                }

                Phase::ResultsSent => {
                    phase = self.buffer_return;
                }

                Phase::CommandDone => {
                    self.init_fdc();
                    return;
                }

                Phase::SenseDriveDone => {
                    self.st0 &= 0x3F;
                    self.init_fdc();
                    return;
                }
            }
        }
    }

    /// Decode a fresh command byte and set up its parameter phase.
    fn dispatch_command(&mut self) {
        self.num_params = 0;
        self.num_results = 0;
        self.sectors_transferred = 0;
        self.cmd_byte = self.data_latch;
        self.last_cmd = self.cmd_byte & 0x1F;

        match self.cmd_byte & 0x1F {
            CMD_READ_DATA => {
                self.read_mode = ReadMode::Data;
                self.dam_mask = 0;
                self.notify_active();
                self.start_receive_params(8, Phase::ReadParamsDone);
            }
            CMD_READ_DELETED_DATA => {
                self.read_mode = ReadMode::DeletedData;
                self.dam_mask = ST2_CONTROL_MARK;
                self.notify_active();
                self.start_receive_params(8, Phase::ReadParamsDone);
            }
            CMD_READ_TRACK => {
                self.read_mode = ReadMode::Track;
                self.notify_active();
                self.start_receive_params(8, Phase::ReadParamsDone);
            }
            CMD_WRITE_DATA => {
                self.write_mode = WriteMode::Data;
                self.dam_mask = 0;
                self.notify_active();
                self.start_receive_params(8, Phase::WriteParamsDone);
            }
            CMD_WRITE_DELETED_DATA => {
                self.write_mode = WriteMode::DeletedData;
                self.dam_mask = ST2_CONTROL_MARK;
                self.notify_active();
                self.start_receive_params(8, Phase::WriteParamsDone);
            }
            CMD_READ_ID => {
                self.notify_active();
                self.start_receive_params(1, Phase::ReadIdParamsDone);
            }
            CMD_RECALIBRATE => {
                self.st0 &= !ST0_SEEK_END;
                self.start_receive_params(1, Phase::RecalibrateParamsDone);
            }
            CMD_SEEK => {
                self.start_receive_params(2, Phase::SeekParamsDone);
            }
            CMD_SPECIFY => {
                self.start_receive_params(2, Phase::SpecifyParamsDone);
            }
            CMD_SENSE_DRIVE => {
                self.start_receive_params(1, Phase::SenseDriveParamsDone);
            }
            CMD_SENSE_INTERRUPT => {
                self.sense_interrupt_status();
            }
            CMD_VERSION => {
                self.command_callback(1);
                self.st0 = 0x80; // uPD765A identifier
                self.results[0] = self.st0;
                self.main_status |= MSR_CB;
                self.num_results = 1;
                self.start_send(SendSource::Results, 0, 1, Phase::CommandDone);
            }
            CMD_FORMAT_TRACK | CMD_SCAN_EQUAL | CMD_SCAN_LOW_OR_EQUAL
            | CMD_SCAN_HIGH_OR_EQUAL => {
                // Accepted but not emulated: the media never changes.
                self.init_fdc();
            }
            _ => {
                self.command_callback(1);
                self.st0 = (self.st0 & 0x3F) | ST0_INVALID;
                self.results[0] = self.st0;
                self.main_status |= MSR_CB;
                self.num_results = 1;
                self.start_send(SendSource::Results, 0, 1, Phase::CommandDone);
            }
        }
    }

    /// Command over: ready for the next one. The callback fires with a
    /// zero command byte so hosts can see the bus go quiet.
    fn init_fdc(&mut self) {
        self.phase = Phase::AwaitCommand;
        self.overrun_test = false;
        self.overrun_error = false;
        self.main_status = MSR_RQM;
        self.cmd_byte = 0;
        self.command_callback(1);
    }

    fn start_receive_params(&mut self, count: u16, done: Phase) {
        self.num_params = count as u8;
        self.start_receive(RecvTarget::Params, 0, count, done);
    }

    /// Suspend until the host has written `count` bytes to `target`.
    fn start_receive(&mut self, target: RecvTarget, offset: usize, count: u16, done: Phase) {
        self.rcv_target = target;
        self.rcv_off = offset;
        self.rcv_count = count;
        self.return_after_transfer = done;
        self.phase = Phase::ReceiveByte;
        self.main_status = (self.main_status & 0x3F) | MSR_RQM;
    }

    /// Suspend until the host has read `count` bytes from `source`.
    fn start_send(&mut self, source: SendSource, offset: usize, count: u16, done: Phase) {
        self.send_source = source;
        self.send_off = offset;
        self.send_count = count;
        self.return_after_transfer = done;
        self.phase = Phase::SendByte;
        self.main_status |= MSR_RQM | MSR_DIO;
    }

    /// Checks shared by every command carrying a full CHRN parameter
    /// block: drive readiness (including the motor-off grace period) and
    /// head validity against the mounted disk.
    fn trap_standard_errors(&mut self) {
        self.tse_error = false;
        self.selected_unit = usize::from(self.params[0] & 1);
        self.st0 = 0;
        self.st1 = 0;

        let ready = if !self.unit().inserted {
            false
        } else if self.motor_state {
            true
        } else if self.motor_off_timer == 0 {
            false
        } else {
            // Motor spinning down: a few more commands are honored
            // (Scrabble Deluxe reads during spin-down).
            self.motor_off_timer -= 1;
            true
        };

        if ready {
            self.st3 &= !ST3_HEAD;
            self.st0 &= !ST0_HEAD;
            let head = (self.params[0] >> 2) & 1;
            self.unit_mut().chead = head;
            if head != 0 {
                self.st3 |= ST3_HEAD;
                self.st0 |= ST0_HEAD;
                if self.unit().disk_info.num_sides() != 2 {
                    // Head 1 on a single-sided disk: drop to head 0 and
                    // report not ready.
                    self.st3 &= !ST3_HEAD;
                    self.st0 &= !ST0_HEAD;
                    self.unit_mut().chead = 0;
                    self.tse_error = true;
                    self.st0 |= ST0_NOT_READY;
                }
            }
        } else {
            self.tse_error = true;
            self.st0 |= ST0_NOT_READY;
            self.st3 &= !ST3_READY;
        }

        if self.tse_error {
            self.st0 |= ST0_ABNORMAL;
        }
    }

    // -----------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------

    /// Entry for Read Data / Read Deleted Data / Read Track once the 8
    /// parameter bytes are in.
    fn begin_sector_read(&mut self) -> Option<Phase> {
        self.st0 = 0;
        self.st1 = 0;
        self.st2 = 0;
        self.sectors_read = 0;
        self.multi_sector = self.params[3] != self.params[5];

        self.trap_standard_errors();
        if self.tse_error {
            let chrn = [self.params[1], self.params[2], self.params[3], self.params[4]];
            self.results[3..7].copy_from_slice(&chrn);
            self.return_sector_rw_results();
            return None;
        }

        self.main_status |= MSR_EXM | MSR_CB;
        self.index_hole_count = 0;
        self.valid_track = self.unit_mut().load_track();
        if self.read_mode == ReadMode::Track {
            // Read Track starts from the first physical sector.
            self.unit_mut().csr = 0xFF;
        }
        self.locate_and_transfer()
    }

    /// Walk physical sectors looking for the addressed CHRN, for at most
    /// two revolutions, and start the matching transfer. Always ends in
    /// a suspension: sector data, or the 7 result bytes on error.
    fn locate_and_transfer(&mut self) -> Option<Phase> {
        loop {
            // Step onto the next physical sector, wrapping at the end of
            // the list, and aim the cursors at it.
            let num_sectors = self.unit().track.num_sectors();
            let mut index = self.unit().csr.wrapping_add(1);
            if index >= num_sectors {
                index = 0;
            }
            self.unit_mut().csr = index;
            self.current_info = OFF_SECTOR_INFO_LIST;
            self.current_data = OFF_SECTOR_DATA;
            for _ in 0..index {
                self.advance_sector_ptrs();
            }
            self.current_sector_size = self.dsk_sector_size();
            self.st2_dam_bit = 0;

            loop {
                let info = self.unit().track.sector_info_at(self.current_info);
                self.results[3] = info.c;
                self.results[4] = info.h;
                self.results[5] = info.r;
                self.results[6] = info.n;
                self.st1 = info.st1 & ST1_ERROR_BITS;
                self.st2 = info.st2 & ST2_ERROR_BITS;

                if !self.valid_track {
                    // Unformatted track: nothing but a missing address
                    // mark to report.
                    self.st0 = ST0_ABNORMAL;
                    self.st1 = ST1_MISSING_AM;
                    let ctk = self.unit().ctk;
                    if ctk != self.params[1] {
                        self.st2 |= if ctk == 0xFF {
                            ST2_BAD_CYLINDER
                        } else {
                            ST2_WRONG_CYLINDER
                        };
                    }
                    self.results[3] = ctk;
                    self.results[4] = self.params[2];
                    self.results[5] = self.params[3];
                    self.results[6] = self.params[4];
                    self.return_sector_rw_results();
                    return None;
                }

                if self.read_mode == ReadMode::Track {
                    // Read Track takes sectors in physical order; IDs are
                    // reported, not compared.
                    self.sectors_read += 1;
                    return self.sector_to_cpu(Phase::AfterSectorRead);
                }

                let target =
                    [self.params[1], self.params[2], self.params[3], self.params[4]];
                if [info.c, info.h, info.r, info.n] == target {
                    if self.multi_sector {
                        // Per-sector error bits recorded in the image are
                        // ignored across a multi-sector run.
                        self.st1 = 0;
                        self.st2 = ST2_CONTROL_MARK;
                    } else {
                        self.st2_dam_bit = 0;
                        if (self.st1 | self.st2) & 0x3F != 0 {
                            // The image records this sector as bad:
                            // transfer what is there and report it,
                            // skipping the mark check.
                            return self.sector_to_cpu(Phase::AfterDamMismatch);
                        }
                    }

                    if ((info.st2 & ST2_CONTROL_MARK) ^ self.dam_mask) == 0 {
                        self.sectors_read += 1;
                        return self.sector_to_cpu(Phase::AfterSectorRead);
                    }
                    if self.cmd_byte & CMD_SKIP_FLAG == 0 {
                        // Mark mismatch without SK: flag the control
                        // mark, transfer the data anyway, then stop.
                        self.st2_dam_bit = ST2_CONTROL_MARK;
                        self.st0 |= ST0_ABNORMAL;
                        return self.sector_to_cpu(Phase::AfterDamMismatch);
                    }
                    // SK set: pretend the sector is not there.
                }

                self.advance_sector_ptrs();
                let next = self.unit().csr.wrapping_add(1);
                if next < num_sectors {
                    self.unit_mut().csr = next;
                    continue;
                }
                self.unit_mut().csr = 0xFF;
                self.index_hole_count += 1;
                if self.index_hole_count < 2 {
                    break; // next revolution
                }

                // Two revolutions without a match: no data.
                self.unit_mut().csr = 0;
                self.st1 |= ST1_NO_DATA;
                self.st0 = (self.st0 & 0x3F) | ST0_ABNORMAL;
                self.results[5] = 1;
                self.return_sector_rw_results();
                return None;
            }
        }
    }

    /// Successful end of a read command: the sector at EOT went out.
    /// End-of-cylinder plus abnormal termination is the chip's way of
    /// saying "you asked for no more".
    fn read_complete(&mut self, info: SectorInfo) {
        self.st0 = ST0_ABNORMAL;
        self.st1 = ST1_END_OF_CYLINDER;
        self.results[3] = self.unit().ctk;
        self.results[4] = info.h;
        self.results[5] = info.r;
        self.results[6] = info.n;
        self.return_sector_rw_results();
    }

    /// Start streaming the current sector to the CPU.
    ///
    /// Sector length follows N (`128 << N`, 32 KiB cap), or DTL when
    /// N = 0. Sectors flagged unreadable are served from the
    /// randomization buffer so two reads never agree.
    fn sector_to_cpu(&mut self, after: Phase) -> Option<Phase> {
        let info = self.unit().track.sector_info_at(self.current_info);

        let (physical, available);
        if self.params[4] == 0 {
            let dtl = u32::from(self.params[7].min(128));
            physical = dtl;
            available = dtl;
        } else {
            let n = self.params[4].min(8);
            physical = (128u32 << n).min(32768);
            available = if self.unit().edsk_source {
                u32::from(info.data_len)
            } else {
                physical
            };
        }
        self.physical_sector_size = physical;
        self.available_sector_data = available;
        self.sector_read_return = after;

        // A head-field mismatch, or both data-error bits set, marks a
        // sector whose reads must not be stable.
        let randomize = info.h != self.params[2]
            || (info.st1 & ST1_DATA_ERROR != 0 && info.st2 & ST2_DATA_ERROR != 0);

        let (source, offset) = if randomize {
            if available > physical && available / physical >= 2 {
                // Overdumped sector: the image holds several revolutions'
                // worth of data. Serve a different copy each time around.
                let copies = available / physical;
                self.multiple_sector_pick += 1;
                if self.multiple_sector_pick >= copies {
                    self.multiple_sector_pick = 0;
                }
                (
                    SendSource::TrackData,
                    self.current_data + (self.multiple_sector_pick * physical) as usize,
                )
            } else {
                self.fill_random_buffer();
                (SendSource::RandomBuf, 0)
            }
        } else {
            (SendSource::TrackData, self.current_data)
        };

        if self.sectors_transferred > 0 {
            // Every successive sector of one command gets its own
            // callback so hosts can track multi-sector progress.
            self.command_callback(9);
        }

        if physical == 0 {
            return Some(Phase::SectorToCpuDone);
        }
        self.start_send(source, offset, physical as u16, Phase::SectorToCpuDone);
        None
    }

    /// Populate the randomization buffer for an unreadable sector: the
    /// stored bytes, topped up with a marching fill, then one byte made
    /// unstable so repeated reads differ.
    fn fill_random_buffer(&mut self) {
        let physical = self.physical_sector_size as usize;
        let cap = physical.min(Self::RANDOM_BUF_LEN);
        let available = (self.available_sector_data as usize).min(Self::RANDOM_BUF_LEN);

        self.units[self.selected_unit]
            .track
            .copy_to(self.current_data, &mut self.random_buf[..available]);

        let (mut fill, step) = if self.random_method == RandomMethod::ZeroFill {
            (0u8, 0u8)
        } else {
            (self.random_seed, 3u8)
        };
        for slot in &mut self.random_buf[available.min(cap)..cap] {
            *slot = fill;
            fill = fill.wrapping_add(step);
        }
        self.random_seed = fill;

        // Sectors of 8 KiB and up (N >= 6) go out as filled; smaller
        // ones get their marker byte corrupted unless zero-fill was
        // requested.
        if physical == 0 || physical >= 8192 || self.random_method == RandomMethod::ZeroFill {
            return;
        }

        self.random_seed = self.random_seed.wrapping_add(3);
        let poke = self.random_seed;
        let first_byte = match self.random_method {
            RandomMethod::FirstByte => true,
            RandomMethod::Auto => self.matches_first_byte_title(),
            _ => false,
        };
        if first_byte {
            self.random_buf[0] = poke;
        } else {
            self.random_buf[cap - 1] = poke;
        }
    }

    /// Known titles whose protection checks the first byte of a damaged
    /// sector rather than the last.
    fn matches_first_byte_title(&self) -> bool {
        let dword = |offset: usize| {
            u32::from_le_bytes([
                self.random_buf[offset],
                self.random_buf[offset + 1],
                self.random_buf[offset + 2],
                self.random_buf[offset + 3],
            ])
        };
        let head = [dword(0), dword(4)];
        head == DIXONS_PREMIERE_1 || head == DIXONS_PREMIERE_2 || head == HOPPING_MAD
    }

    /// Assemble ST0..ST2 and send the 7 result bytes of a sector
    /// command. CHRN result bytes were filled by the caller.
    fn return_sector_rw_results(&mut self) {
        self.st0 = (self.st0 & !ST0_HEAD) | (self.unit().chead << 2);
        self.st0 = (self.st0 & 0xFC) | (self.params[0] & 3);
        self.results[0] = self.st0;
        self.results[1] = self.st1;
        self.st2 = (self.st2 & !ST2_CONTROL_MARK) | self.st2_dam_bit;
        self.results[2] = self.st2;
        self.overrun_error = false;
        // The execution phase ends as the result phase starts.
        self.main_status &= !MSR_EXM;
        self.num_results = 7;
        self.start_send(SendSource::Results, 0, 7, Phase::ResultsSent);
    }

    // -----------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------

    /// Entry for Write Data / Write Deleted Data once the 8 parameter
    /// bytes are in. Single-sector writes into standard DSK images; an
    /// EDSK-sourced disk is always write-protected.
    fn begin_sector_write(&mut self) -> Option<Phase> {
        self.st0 = 0;
        self.st1 = 0;
        self.st2 = 0;
        self.st2_dam_bit = 0;

        self.trap_standard_errors();
        if self.unit().write_protect {
            self.tse_error = true;
            self.st0 = (self.st0 & 0x3F) | ST0_ABNORMAL;
            self.st1 |= ST1_NOT_WRITABLE;
        }
        if self.tse_error {
            let chrn = [self.params[1], self.params[2], self.params[3], self.params[4]];
            self.results[3..7].copy_from_slice(&chrn);
            self.return_sector_rw_results();
            return None;
        }

        self.main_status |= MSR_EXM | MSR_CB;
        self.valid_track = self.unit_mut().load_track();
        self.current_sector_size = self.dsk_sector_size();
        self.current_data = OFF_SECTOR_DATA;
        self.current_info = OFF_SECTOR_INFO_LIST;
        self.current_sector_number = 0;
        self.write_locate()
    }

    /// Find the next sector whose R lies in the command's R..=EOT range
    /// and receive its data from the CPU.
    fn write_locate(&mut self) -> Option<Phase> {
        loop {
            let info = self.unit().track.sector_info_at(self.current_info);
            if info.r >= self.params[3] && info.r <= self.params[5] {
                self.sector_write_return = Phase::WriteNextSector;
                let count = if self.params[4] == 0 {
                    u16::from(self.params[7])
                } else {
                    self.current_sector_size as u16
                };
                if count == 0 {
                    return Some(Phase::CpuToSectorDone);
                }
                let offset = self.current_data;
                self.start_receive(RecvTarget::TrackData, offset, count, Phase::CpuToSectorDone);
                return None;
            }
            if !self.write_advance() {
                self.return_sector_rw_results();
                return None;
            }
        }
    }

    /// Move to the next sector of the track; false when the list is
    /// exhausted.
    fn write_advance(&mut self) -> bool {
        self.current_info += SECTOR_INFO_LEN;
        self.current_data += self.current_sector_size as usize;
        self.current_sector_number = self.current_sector_number.wrapping_add(1);
        self.current_sector_number != self.unit().track.num_sectors()
    }

    // -----------------------------------------------------------------
    // Read Sector ID, Sense Drive Status, Sense Interrupt Status
    // -----------------------------------------------------------------

    /// Read Sector ID: report the CHRN of the sector under the head.
    ///
    /// After a seek the head needs to settle; the chip reports the
    /// track's first sector for a while (nine commands here) before the
    /// rotation becomes visible again.
    fn read_sector_id(&mut self) {
        self.main_status |= MSR_CB;
        self.st2 = 0;
        self.trap_standard_errors();

        if self.tse_error {
            self.current_info = OFF_SECTOR_INFO_LIST;
            self.read_id_results();
        } else {
            self.valid_track = self.unit_mut().load_track();
            if self.valid_track {
                let num_sectors = self.unit().track.num_sectors();
                let index = if self.ret_csr0 > 0 {
                    self.ret_csr0 -= 1;
                    0
                } else {
                    let next = self.unit().csr.wrapping_add(1);
                    if next >= num_sectors { 0 } else { next }
                };
                self.unit_mut().csr = index;
                self.current_info =
                    OFF_SECTOR_INFO_LIST + usize::from(index) * SECTOR_INFO_LEN;
                self.st0 &= 0x3F;
                self.read_id_results();
            } else {
                self.results[0] = 0;
                self.results[1] = ST1_MISSING_AM;
                self.results[3] = self.unit().ctk;
            }
        }
        self.read_id_send_results();
    }

    /// Fill the 7 Read Sector ID result bytes from the current sector
    /// info entry.
    fn read_id_results(&mut self) {
        self.st0 = (self.st0 & 0xFC) | (self.params[0] & 3);
        self.results[0] = self.st0;
        let info = self.unit().track.sector_info_at(self.current_info);
        // An ID read never touches the data field, so it cannot report a
        // data CRC error (Epyx 21 relies on this).
        self.results[1] = info.st1 & !ST1_DATA_ERROR;
        self.results[2] = info.st2 & !ST2_DATA_ERROR;
        self.results[3] = info.c;
        self.results[4] = info.h;
        self.results[5] = info.r;
        self.results[6] = info.n;
    }

    /// Send the Read Sector ID results, exposing the CHRN to the command
    /// callback ahead of the result phase.
    fn read_id_send_results(&mut self) {
        let chrn = [
            self.results[3],
            self.results[4],
            self.results[5],
            self.results[6],
        ];
        self.params[1..5].copy_from_slice(&chrn);
        self.command_callback(6);
        self.num_results = 7;
        self.start_send(SendSource::Results, 0, 7, Phase::CommandDone);
    }

    /// Sense Drive Status: one ST3 result byte.
    fn sense_drive_status(&mut self) {
        self.command_callback(2);
        self.main_status |= MSR_CB;
        self.selected_unit = usize::from(self.params[0] & 1);

        // Write-protected until proven otherwise.
        self.st3 = ST3_WRITE_PROTECT;
        self.st3 |= self.params[0] & 3;
        self.st3 |= self.unit().chead << 2;
        if self.unit().ctk == 0 {
            self.st3 |= ST3_TRACK0;
        }
        if self.unit().inserted && self.motor_state {
            self.st3 |= ST3_READY;
            if !self.unit().write_protect {
                self.st3 &= !ST3_WRITE_PROTECT;
            }
        }
        self.results[0] = self.st3;
        self.num_results = 1;
        self.start_send(SendSource::Results, 0, 1, Phase::SenseDriveDone);
    }

    /// Sense Interrupt Status: acknowledge a seek completion (two result
    /// bytes) or report the ready-line latch (one byte).
    fn sense_interrupt_status(&mut self) {
        self.command_callback(1);
        self.main_status |= MSR_CB;
        let unit_index = self.seek_unit.unwrap_or(0);

        let count;
        let mut byte;
        if self.units[unit_index].seek_done {
            self.units[unit_index].seek_done = false;
            // Head settle: Read Sector ID reports the first sector for a
            // while after a seek.
            self.ret_csr0 = 9;
            byte = self.seek_result | (self.units[unit_index].chead << 2);
            count = 2;
        } else if self.units[unit_index].drive_state_changed {
            self.units[unit_index].drive_state_changed = false;
            byte = 0xC0; // ready line changed, either polarity
            count = 1;
        } else {
            byte = 0x80;
            count = 1;
        }
        if unit_index == 1 {
            byte |= 1;
        }
        self.st0 = byte;
        self.results[0] = byte;
        self.results[1] = self.units[unit_index].ctk;
        self.num_results = count as u8;
        self.start_send(SendSource::Results, 0, count, Phase::CommandDone);
    }

    // -----------------------------------------------------------------
    // Shared sector geometry helpers
    // -----------------------------------------------------------------

    /// Stored length of each sector in this track's DSK layout:
    /// `128 << N`, with oversized codes collapsing to 6144 bytes.
    fn dsk_sector_size(&self) -> u32 {
        let code = self.unit().track.sector_size();
        if code <= 5 { 128 << code } else { 6144 }
    }

    /// Step the info/data cursors over the current sector. EDSK sources
    /// store true byte lengths per sector; DSK strides are uniform.
    fn advance_sector_ptrs(&mut self) {
        let info = self.unit().track.sector_info_at(self.current_info);
        let step = if self.unit().edsk_source {
            usize::from(info.data_len)
        } else {
            self.dsk_sector_size() as usize
        };
        self.current_data += step;
        self.current_info += SECTOR_INFO_LEN;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use format_dsk::{EXTENDED_SIGNATURE, STANDARD_SIGNATURE, TRACK_SIGNATURE};

    use crate::{MSR_CB, MSR_DIO, MSR_EXM, MSR_RQM, Upd765a};

    const SECTORS: u8 = 9;
    const SECTOR_LEN: usize = 512;
    const TRACK_SIZE: usize = 0x100 + SECTORS as usize * SECTOR_LEN;

    /// Single-sided test disk: 9 sectors of 512 bytes per track, R=1..=9.
    /// Sector data starts with (cylinder, side, R) and is 0xE5 elsewhere.
    fn build_dsk(tracks: u8) -> Vec<u8> {
        build_dsk_sided(tracks, 1)
    }

    fn build_dsk_sided(tracks: u8, sides: u8) -> Vec<u8> {
        let total = usize::from(tracks) * usize::from(sides);
        let mut image = vec![0u8; 0x100 + total * TRACK_SIZE];
        image[..STANDARD_SIGNATURE.len()].copy_from_slice(STANDARD_SIGNATURE);
        image[0x30] = tracks;
        image[0x31] = sides;
        image[0x32..0x34].copy_from_slice(&(TRACK_SIZE as u16).to_le_bytes());

        for t in 0..total {
            let base = 0x100 + t * TRACK_SIZE;
            let cyl = (t / usize::from(sides)) as u8;
            let side = (t % usize::from(sides)) as u8;
            image[base..base + TRACK_SIGNATURE.len()].copy_from_slice(TRACK_SIGNATURE);
            image[base + 0x10] = cyl;
            image[base + 0x11] = side;
            image[base + 0x14] = 2; // N=2, 512 bytes
            image[base + 0x15] = SECTORS;
            image[base + 0x16] = 0x4E;
            image[base + 0x17] = 0xE5;
            for s in 0..usize::from(SECTORS) {
                let entry = base + 0x18 + s * 8;
                image[entry] = cyl;
                image[entry + 1] = side;
                image[entry + 2] = s as u8 + 1;
                image[entry + 3] = 2;
                image[entry + 6..entry + 8].copy_from_slice(&(SECTOR_LEN as u16).to_le_bytes());

                let data = base + 0x100 + s * SECTOR_LEN;
                image[data..data + SECTOR_LEN].fill(0xE5);
                image[data] = cyl;
                image[data + 1] = side;
                image[data + 2] = s as u8 + 1;
            }
        }
        image
    }

    /// Minimal EDSK: one track, one side, one 256-byte sector (R=1, N=1).
    fn build_edsk() -> Vec<u8> {
        let mut image = vec![0u8; 0x100];
        image[..EXTENDED_SIGNATURE.len()].copy_from_slice(EXTENDED_SIGNATURE);
        image[0x30] = 1;
        image[0x31] = 1;
        image[0x34] = 2;

        let mut track = vec![0u8; 0x100];
        track[..TRACK_SIGNATURE.len()].copy_from_slice(TRACK_SIGNATURE);
        track[0x14] = 1;
        track[0x15] = 1;
        track[0x18] = 0; // C
        track[0x19] = 0; // H
        track[0x1A] = 1; // R
        track[0x1B] = 1; // N
        track[0x1E..0x20].copy_from_slice(&256u16.to_le_bytes());
        image.extend_from_slice(&track);

        let mut data = vec![0x11u8; 256];
        data[0] = 0xD0;
        data[255] = 0xD1;
        image.extend_from_slice(&data);
        image
    }

    fn fdc_with_disk(tracks: u8) -> Upd765a {
        let mut fdc = Upd765a::new();
        fdc.insert_disk(build_dsk(tracks), false, 0);
        fdc.set_motor_state(0x08);
        fdc
    }

    fn write_all(fdc: &mut Upd765a, bytes: &[u8]) {
        for &byte in bytes {
            fdc.data_port_write(byte);
        }
    }

    fn read_bytes(fdc: &mut Upd765a, count: usize) -> Vec<u8> {
        (0..count).map(|_| fdc.data_port_read()).collect()
    }

    /// Seek and acknowledge the completion interrupt.
    fn seek_to(fdc: &mut Upd765a, cylinder: u8) -> Vec<u8> {
        write_all(fdc, &[0x0F, 0x00, cylinder]);
        write_all(fdc, &[0x08]);
        read_bytes(fdc, 2)
    }

    #[test]
    fn specify_consumes_two_parameters() {
        let mut fdc = Upd765a::new();
        fdc.data_port_write(0x03);
        assert_eq!(fdc.main_status, MSR_RQM, "awaiting parameters");
        fdc.data_port_write(0xDF);
        fdc.data_port_write(0x02);
        assert_eq!(fdc.main_status, MSR_RQM);
        assert_eq!(fdc.phase, super::Phase::AwaitCommand);
    }

    #[test]
    fn sense_interrupt_without_event_reports_idle() {
        let mut fdc = Upd765a::new();
        fdc.data_port_write(0x08);
        assert_eq!(fdc.main_status, MSR_RQM | MSR_DIO | MSR_CB);
        assert_eq!(fdc.data_port_read(), 0x80);
        assert_eq!(fdc.main_status, MSR_RQM);
    }

    #[test]
    fn sense_interrupt_reports_ready_line_change_once() {
        let mut fdc = fdc_with_disk(1);
        fdc.data_port_write(0x08);
        assert_eq!(fdc.data_port_read(), 0xC0, "insert raised the ready line");
        fdc.data_port_write(0x08);
        assert_eq!(fdc.data_port_read(), 0x80, "latch cleared by the first sense");
    }

    #[test]
    fn recalibrate_then_sense_interrupt() {
        let mut fdc = fdc_with_disk(40);
        let _ = seek_to(&mut fdc, 12);

        write_all(&mut fdc, &[0x07, 0x00]);
        assert_eq!(fdc.main_status, MSR_RQM, "no result phase");
        write_all(&mut fdc, &[0x08]);
        let result = read_bytes(&mut fdc, 2);
        assert_eq!(result, vec![0x20, 0x00]);
        assert_eq!(fdc.main_status, MSR_RQM);
    }

    #[test]
    fn seek_updates_track_and_reports_it() {
        let mut fdc = fdc_with_disk(40);
        let result = seek_to(&mut fdc, 5);
        assert_eq!(result, vec![0x20, 0x05]);
        assert_eq!(fdc.get_fdc_state().unit0.track, 5);
        assert_eq!(fdc.get_fdc_state().unit0.sector, 0);
    }

    #[test]
    fn seek_past_last_cylinder_clamps() {
        let mut fdc = fdc_with_disk(40);
        let result = seek_to(&mut fdc, 99);
        assert_eq!(result, vec![0x60, 39], "abnormal seek, head on last cylinder");
    }

    #[test]
    fn version_identifies_upd765a() {
        let mut fdc = Upd765a::new();
        fdc.data_port_write(0x10);
        assert_eq!(fdc.main_status, 0xD0);
        assert_eq!(fdc.data_port_read(), 0x80);
        assert_eq!(fdc.main_status, MSR_RQM);
    }

    #[test]
    fn invalid_command_returns_single_status_byte() {
        let mut fdc = Upd765a::new();
        fdc.data_port_write(0x1F);
        assert_eq!(fdc.data_port_read(), 0x80);
        assert_eq!(fdc.main_status, MSR_RQM);
    }

    #[test]
    fn format_track_and_scan_are_stubs() {
        let mut fdc = fdc_with_disk(1);
        for cmd in [0x0D, 0x11, 0x19, 0x1D] {
            fdc.data_port_write(cmd);
            assert_eq!(fdc.main_status, MSR_RQM, "stub {cmd:#x} returns to idle");
        }
        // The controller still takes real commands afterwards.
        fdc.data_port_write(0x10);
        assert_eq!(fdc.data_port_read(), 0x80);
    }

    #[test]
    fn sense_drive_status_composes_st3() {
        let mut fdc = fdc_with_disk(1);
        write_all(&mut fdc, &[0x04, 0x00]);
        // Ready, track 0, writable.
        assert_eq!(fdc.data_port_read(), 0x30);

        fdc.set_motor_state(0);
        write_all(&mut fdc, &[0x04, 0x00]);
        // Motor off: not ready, and the write-protect assumption stands.
        assert_eq!(fdc.data_port_read(), 0x50);
    }

    #[test]
    fn sense_drive_status_reports_write_protect() {
        let mut fdc = Upd765a::new();
        fdc.insert_disk(build_dsk(1), true, 0);
        fdc.set_motor_state(0x08);
        write_all(&mut fdc, &[0x04, 0x00]);
        assert_eq!(fdc.data_port_read(), 0x70);
    }

    #[test]
    fn read_data_streams_one_sector() {
        let mut fdc = fdc_with_disk(40);
        let _ = seek_to(&mut fdc, 5);

        write_all(&mut fdc, &[0x06, 0x00, 0x05, 0x00, 0x01, 0x02, 0x01, 0x2A, 0xFF]);
        assert_eq!(
            fdc.main_status,
            MSR_RQM | MSR_DIO | MSR_EXM | MSR_CB,
            "execution phase, FDC to CPU"
        );

        let data = read_bytes(&mut fdc, SECTOR_LEN);
        assert_eq!(&data[..3], &[5, 0, 1], "sector (5,0,1) content");
        assert!(data[3..].iter().all(|&b| b == 0xE5));

        let result = read_bytes(&mut fdc, 7);
        assert_eq!(result[0], 0x40, "IC=01: end of cylinder termination");
        assert_eq!(result[1], 0x80, "EN set");
        assert_eq!(result[2], 0x00);
        assert_eq!(&result[3..], &[5, 0, 1, 2]);
        assert_eq!(fdc.main_status, MSR_RQM);
    }

    #[test]
    fn read_data_multi_sector_advances_r() {
        let mut fdc = fdc_with_disk(1);
        let _ = seek_to(&mut fdc, 0);

        write_all(&mut fdc, &[0x06, 0x00, 0x00, 0x00, 0x01, 0x02, 0x02, 0x2A, 0xFF]);
        let data = read_bytes(&mut fdc, 2 * SECTOR_LEN);
        assert_eq!(data[2], 1, "first sector R=1");
        assert_eq!(data[SECTOR_LEN + 2], 2, "second sector R=2");

        let result = read_bytes(&mut fdc, 7);
        assert_eq!(result[0], 0x40);
        assert_eq!(result[1], 0x80);
        assert_eq!(result[5], 2, "R of the final sector");
    }

    #[test]
    fn read_data_without_disk_is_not_ready() {
        let mut fdc = Upd765a::new();
        write_all(&mut fdc, &[0x06, 0x00, 0x00, 0x00, 0x01, 0x02, 0x01, 0x2A, 0xFF]);
        let result = read_bytes(&mut fdc, 7);
        assert_eq!(result[0] & 0xC0, 0x40, "abnormal termination");
        assert_eq!(result[0] & 0x08, 0x08, "not ready");
        assert_eq!(&result[3..], &[0x00, 0x00, 0x01, 0x02], "CHRN echoed from command");
    }

    #[test]
    fn read_data_head_1_on_single_sided_disk_fails() {
        let mut fdc = fdc_with_disk(1);
        write_all(&mut fdc, &[0x06, 0x04, 0x00, 0x01, 0x01, 0x02, 0x01, 0x2A, 0xFF]);
        let result = read_bytes(&mut fdc, 7);
        assert_eq!(result[0] & 0xC0, 0x40);
        assert_eq!(result[0] & 0x08, 0x08);
        assert_eq!(fdc.get_fdc_state().unit0.head, 0, "head forced back to 0");
    }

    #[test]
    fn read_data_missing_sector_reports_no_data() {
        let mut fdc = fdc_with_disk(1);
        write_all(&mut fdc, &[0x06, 0x00, 0x00, 0x00, 0x20, 0x02, 0x20, 0x2A, 0xFF]);
        let result = read_bytes(&mut fdc, 7);
        assert_eq!(result[0] & 0xC0, 0x40);
        assert_eq!(result[1] & 0x04, 0x04, "no data after two revolutions");
        assert_eq!(result[5], 1);
    }

    #[test]
    fn read_data_wrong_cylinder_on_unformatted_track() {
        let mut fdc = Upd765a::new();
        let mut image = build_dsk(2);
        // Wipe track 1's signature so it reads as unformatted.
        let base = 0x100 + TRACK_SIZE;
        image[base..base + 10].fill(0);
        fdc.insert_disk(image, false, 0);
        fdc.set_motor_state(0x08);
        let _ = seek_to(&mut fdc, 1);

        write_all(&mut fdc, &[0x06, 0x00, 0x00, 0x00, 0x01, 0x02, 0x01, 0x2A, 0xFF]);
        let result = read_bytes(&mut fdc, 7);
        assert_eq!(result[0] & 0xC0, 0x40);
        assert_eq!(result[1], 0x01, "missing address mark");
        assert_eq!(result[2] & 0x10, 0x10, "wrong cylinder: head on 1, command says 0");
        assert_eq!(result[3], 1, "C reports the physical track");
    }

    #[test]
    fn deleted_data_mark_matches_read_deleted() {
        let mut fdc = Upd765a::new();
        let mut image = build_dsk(1);
        // Flag sector R=1 as carrying a deleted data mark.
        image[0x100 + 0x18 + 5] = 0x40;
        fdc.insert_disk(image, false, 0);
        fdc.set_motor_state(0x08);

        write_all(&mut fdc, &[0x0C, 0x00, 0x00, 0x00, 0x01, 0x02, 0x01, 0x2A, 0xFF]);
        let data = read_bytes(&mut fdc, SECTOR_LEN);
        assert_eq!(data[2], 1);
        let result = read_bytes(&mut fdc, 7);
        assert_eq!(result[0], 0x40);
        assert_eq!(result[2] & 0x40, 0, "no control mark for a matching command");
    }

    #[test]
    fn deleted_mark_without_sk_sets_control_mark() {
        let mut fdc = Upd765a::new();
        let mut image = build_dsk(1);
        image[0x100 + 0x18 + 5] = 0x40;
        fdc.insert_disk(image, false, 0);
        fdc.set_motor_state(0x08);

        // Plain Read Data, SK clear: data still comes over, CM reported.
        write_all(&mut fdc, &[0x06, 0x00, 0x00, 0x00, 0x01, 0x02, 0x01, 0x2A, 0xFF]);
        let data = read_bytes(&mut fdc, SECTOR_LEN);
        assert_eq!(data[2], 1);
        let result = read_bytes(&mut fdc, 7);
        assert_eq!(result[0] & 0xC0, 0x40);
        assert_eq!(result[2] & 0x40, 0x40, "control mark");
        assert_eq!(result[1] & 0x80, 0x80);
    }

    #[test]
    fn deleted_mark_with_sk_skips_to_no_data() {
        let mut fdc = Upd765a::new();
        let mut image = build_dsk(1);
        image[0x100 + 0x18 + 5] = 0x40;
        fdc.insert_disk(image, false, 0);
        fdc.set_motor_state(0x08);

        write_all(&mut fdc, &[0x26, 0x00, 0x00, 0x00, 0x01, 0x02, 0x01, 0x2A, 0xFF]);
        let result = read_bytes(&mut fdc, 7);
        assert_eq!(result[1] & 0x04, 0x04, "skipped everywhere, no data");
    }

    #[test]
    fn read_track_takes_sectors_in_physical_order() {
        let mut fdc = fdc_with_disk(1);
        write_all(&mut fdc, &[0x02, 0x00, 0x00, 0x00, 0x01, 0x02, 0x03, 0x2A, 0xFF]);
        let data = read_bytes(&mut fdc, 3 * SECTOR_LEN);
        assert_eq!(data[2], 1);
        assert_eq!(data[SECTOR_LEN + 2], 2);
        assert_eq!(data[2 * SECTOR_LEN + 2], 3);
        let result = read_bytes(&mut fdc, 7);
        assert_eq!(result[0], 0x40);
        assert_eq!(result[5], 3, "last sector reached EOT");
    }

    #[test]
    fn bad_sector_reads_differ_between_revolutions() {
        let mut fdc = Upd765a::new();
        let mut image = build_dsk(1);
        // Both data-error bits: the classic "weak sector" protection.
        image[0x100 + 0x18 + 4] = 0x20;
        image[0x100 + 0x18 + 5] = 0x20;
        fdc.insert_disk(image, false, 0);
        fdc.set_motor_state(0x08);

        let cmd = [0x06, 0x00, 0x00, 0x00, 0x01, 0x02, 0x01, 0x2A, 0xFF];
        write_all(&mut fdc, &cmd);
        let first = read_bytes(&mut fdc, SECTOR_LEN);
        let first_result = read_bytes(&mut fdc, 7);
        write_all(&mut fdc, &cmd);
        let second = read_bytes(&mut fdc, SECTOR_LEN);
        let _ = read_bytes(&mut fdc, 7);

        assert_eq!(first_result[0] & 0xC0, 0, "errors ride in ST1/ST2, not IC");
        assert_eq!(first_result[1], 0xA0, "data error plus end of cylinder");
        assert_eq!(first_result[2], 0x20);
        assert_eq!(&first[..3], &[0, 0, 1], "stored bytes still come over");
        assert_ne!(first[SECTOR_LEN - 1], second[SECTOR_LEN - 1], "unstable byte");
    }

    #[test]
    fn zero_fill_method_keeps_bad_sector_stable() {
        let mut fdc = Upd765a::new();
        let mut image = build_dsk(1);
        image[0x100 + 0x18 + 4] = 0x20;
        image[0x100 + 0x18 + 5] = 0x20;
        fdc.insert_disk(image, false, 0);
        fdc.set_motor_state(0x08);
        fdc.set_random_method(255);

        let cmd = [0x06, 0x00, 0x00, 0x00, 0x01, 0x02, 0x01, 0x2A, 0xFF];
        write_all(&mut fdc, &cmd);
        let first = read_bytes(&mut fdc, SECTOR_LEN);
        let _ = read_bytes(&mut fdc, 7);
        write_all(&mut fdc, &cmd);
        let second = read_bytes(&mut fdc, SECTOR_LEN);
        let _ = read_bytes(&mut fdc, 7);
        assert_eq!(first, second);
        assert_eq!(first[SECTOR_LEN - 1], 0xE5, "stored content untouched");
    }

    #[test]
    fn overrun_expires_after_64_unconsumed_polls() {
        let mut fdc = fdc_with_disk(1);
        write_all(&mut fdc, &[0x06, 0x00, 0x00, 0x00, 0x01, 0x02, 0x01, 0x2A, 0xFF]);
        // First data byte arms the watchdog.
        let _ = fdc.data_port_read();
        for _ in 0..64 {
            let status = fdc.status_port_read();
            assert_eq!(status & MSR_EXM, MSR_EXM, "still transferring");
        }
        let status = fdc.status_port_read();
        assert_eq!(status, 0xD0, "execution phase torn down, results pending");

        let result = read_bytes(&mut fdc, 7);
        assert_eq!(result[0] & 0xC0, 0x40);
        assert_eq!(result[1] & 0x10, 0x10, "overrun");
        assert_eq!(fdc.main_status, MSR_RQM);
    }

    #[test]
    fn consuming_bytes_keeps_the_watchdog_fed() {
        let mut fdc = fdc_with_disk(1);
        write_all(&mut fdc, &[0x06, 0x00, 0x00, 0x00, 0x01, 0x02, 0x01, 0x2A, 0xFF]);
        for _ in 0..SECTOR_LEN {
            for _ in 0..60 {
                let _ = fdc.status_port_read();
            }
            let _ = fdc.data_port_read();
        }
        let result = read_bytes(&mut fdc, 7);
        assert_eq!(result[1] & 0x10, 0, "no overrun while the host keeps up");
    }

    #[test]
    fn motor_off_grace_allows_three_more_commands() {
        let mut fdc = fdc_with_disk(1);
        fdc.set_motor_state(0);

        for _ in 0..3 {
            write_all(&mut fdc, &[0x0A, 0x00]);
            let result = read_bytes(&mut fdc, 7);
            assert_eq!(result[0] & 0xC0, 0, "grace period read succeeds");
        }
        write_all(&mut fdc, &[0x0A, 0x00]);
        let result = read_bytes(&mut fdc, 7);
        assert_eq!(result[0] & 0x48, 0x48, "grace exhausted, not ready");
    }

    #[test]
    fn read_sector_id_rotates_through_the_track() {
        let mut fdc = fdc_with_disk(1);
        // The head starts over sector 0, so the first ID read reports the
        // following sector.
        for expected_r in [2, 3, 4] {
            write_all(&mut fdc, &[0x0A, 0x00]);
            let result = read_bytes(&mut fdc, 7);
            assert_eq!(result[0], 0x00);
            assert_eq!(result[5], expected_r);
            assert_eq!(result[6], 2);
        }
    }

    #[test]
    fn read_sector_id_settles_on_first_sector_after_seek() {
        let mut fdc = fdc_with_disk(40);
        let _ = seek_to(&mut fdc, 5);
        for _ in 0..9 {
            write_all(&mut fdc, &[0x0A, 0x00]);
            let result = read_bytes(&mut fdc, 7);
            assert_eq!(&result[3..], &[5, 0, 1, 2], "head still settling");
        }
        write_all(&mut fdc, &[0x0A, 0x00]);
        let result = read_bytes(&mut fdc, 7);
        assert_eq!(result[5], 2, "rotation visible again");
    }

    #[test]
    fn read_sector_id_on_unformatted_track_reports_missing_mark() {
        let mut fdc = Upd765a::new();
        let mut image = build_dsk(2);
        let base = 0x100 + TRACK_SIZE;
        image[base..base + 10].fill(0);
        fdc.insert_disk(image, false, 0);
        fdc.set_motor_state(0x08);
        let _ = seek_to(&mut fdc, 1);

        write_all(&mut fdc, &[0x0A, 0x00]);
        let result = read_bytes(&mut fdc, 7);
        assert_eq!(result[0], 0x00);
        assert_eq!(result[1], 0x01, "missing address mark");
        assert_eq!(result[3], 1, "C is the physical track");
    }

    #[test]
    fn write_data_round_trips_through_the_image() {
        let mut fdc = fdc_with_disk(1);
        write_all(&mut fdc, &[0x45, 0x00, 0x00, 0x00, 0x02, 0x02, 0x02, 0x2A, 0xFF]);
        assert_eq!(
            fdc.main_status,
            MSR_RQM | MSR_EXM | MSR_CB,
            "execution phase, CPU to FDC"
        );
        for i in 0..SECTOR_LEN {
            fdc.data_port_write((i & 0xFF) as u8);
        }
        let result = read_bytes(&mut fdc, 7);
        assert_eq!(result[0], 0x00, "normal termination");
        assert_eq!(result[1], 0x00);
        assert!(fdc.contents_changed(0));

        // Read the sector back through the controller.
        write_all(&mut fdc, &[0x06, 0x00, 0x00, 0x00, 0x02, 0x02, 0x02, 0x2A, 0xFF]);
        let data = read_bytes(&mut fdc, SECTOR_LEN);
        let _ = read_bytes(&mut fdc, 7);
        assert_eq!(data[0], 0);
        assert_eq!(data[255], 255);
        assert_eq!(data[511], 255);

        // Neighbours are untouched.
        write_all(&mut fdc, &[0x06, 0x00, 0x00, 0x00, 0x01, 0x02, 0x01, 0x2A, 0xFF]);
        let data = read_bytes(&mut fdc, SECTOR_LEN);
        let _ = read_bytes(&mut fdc, 7);
        assert_eq!(data[2], 1);
        assert_eq!(data[3], 0xE5);
    }

    #[test]
    fn write_data_to_protected_disk_fails() {
        let mut fdc = Upd765a::new();
        fdc.insert_disk(build_dsk(1), true, 0);
        fdc.set_motor_state(0x08);
        write_all(&mut fdc, &[0x45, 0x00, 0x00, 0x00, 0x01, 0x02, 0x01, 0x2A, 0xFF]);
        let result = read_bytes(&mut fdc, 7);
        assert_eq!(result[0] & 0xC0, 0x40);
        assert_eq!(result[1] & 0x02, 0x02, "not writable");
        assert!(!fdc.contents_changed(0));
    }

    #[test]
    fn edsk_image_reads_and_refuses_writes() {
        let mut fdc = Upd765a::new();
        fdc.insert_disk(build_edsk(), false, 0);
        fdc.set_motor_state(0x08);
        assert!(fdc.write_protected(0), "EDSK sources are read-only");

        write_all(&mut fdc, &[0x06, 0x00, 0x00, 0x00, 0x01, 0x01, 0x01, 0x2A, 0xFF]);
        let data = read_bytes(&mut fdc, 256);
        assert_eq!(data[0], 0xD0);
        assert_eq!(data[255], 0xD1);
        let result = read_bytes(&mut fdc, 7);
        assert_eq!(result[0], 0x40);

        write_all(&mut fdc, &[0x45, 0x00, 0x00, 0x00, 0x01, 0x01, 0x01, 0x2A, 0xFF]);
        let result = read_bytes(&mut fdc, 7);
        assert_eq!(result[1] & 0x02, 0x02);
    }

    #[test]
    fn dtl_read_with_n_zero_transfers_dtl_bytes() {
        let mut fdc = Upd765a::new();
        let mut image = build_dsk(1);
        // Sector R=1 re-labelled N=0, the only case where DTL applies.
        image[0x100 + 0x18 + 3] = 0;
        fdc.insert_disk(image, false, 0);
        fdc.set_motor_state(0x08);

        write_all(&mut fdc, &[0x06, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x2A, 0x20]);
        let data = read_bytes(&mut fdc, 0x20);
        assert_eq!(data[2], 1);
        let result = read_bytes(&mut fdc, 7);
        assert_eq!(result[0], 0x40);
        assert_eq!(fdc.main_status, MSR_RQM);
    }

    #[test]
    fn command_callback_sees_parameters_and_sector_progress() {
        let mut fdc = fdc_with_disk(1);
        let log: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        fdc.set_command_callback(move |bytes| sink.borrow_mut().push(bytes.to_vec()));

        write_all(&mut fdc, &[0x06, 0x00, 0x00, 0x00, 0x01, 0x02, 0x02, 0x2A, 0xFF]);
        let _ = read_bytes(&mut fdc, 2 * SECTOR_LEN);
        let _ = read_bytes(&mut fdc, 7);

        let log = log.borrow();
        assert_eq!(log[0].len(), 9, "full command block on entry");
        assert_eq!(log[0][0], 0x06);
        assert_eq!(log[1].len(), 9, "second sector of the run");
        assert_eq!(log.last().map(Vec::len), Some(1), "command-over marker");
        assert_eq!(log.last().map(|b| b[0]), Some(0));
    }

    #[test]
    fn active_callback_fires_on_disk_commands() {
        let mut fdc = fdc_with_disk(1);
        let hits = Rc::new(RefCell::new(0u32));
        let sink = Rc::clone(&hits);
        fdc.set_active_callback(move || *sink.borrow_mut() += 1);

        write_all(&mut fdc, &[0x0A, 0x00]);
        let _ = read_bytes(&mut fdc, 7);
        assert_eq!(*hits.borrow(), 1);

        write_all(&mut fdc, &[0x08]);
        let _ = read_bytes(&mut fdc, 1);
        assert_eq!(*hits.borrow(), 1, "sense interrupt is not a disk command");
    }
}
