//! NEC uPD765A floppy disk controller.
//!
//! Register-level emulation of the FDC used in the ZX Spectrum +3 and
//! Amstrad CPC, driving up to two virtual drives loaded from DSK or EDSK
//! images. The host exchanges bytes through two ports and a motor latch;
//! everything else (command decode, seek state, sector transfer, status
//! registers) happens inside the chip.
//!
//! # Register interface
//!
//! - **Main Status Register**: read-only ([`Upd765a::status_port_read`],
//!   port $2FFD on the +3)
//! - **Data Register**: read/write ([`Upd765a::data_port_read`] /
//!   [`Upd765a::data_port_write`], port $3FFD on the +3)
//! - **Motor latch**: bit 3 of the +3's $1FFD control port
//!   ([`Upd765a::set_motor_state`])
//!
//! # Execution model
//!
//! The controller is a resumable state machine driven entirely by port
//! operations. Commands run in the documented three phases (command →
//! execution → result), one byte per port access; between bytes the
//! machine parks on a continuation label and the MSR tells the host which
//! direction the next byte flows. Nothing here owns a thread or a clock:
//! timing-sensitive behavior (the overrun watchdog, the motor-off grace
//! timer) is counted in port accesses, which is what +3DOS and CPC
//! loaders actually observe.
//!
//! # MSR bits
//!
//! | bit | name | meaning |
//! |-----|------|---------|
//! | 7   | RQM  | ready to exchange a byte |
//! | 6   | DIO  | 1 = FDC→CPU, 0 = CPU→FDC |
//! | 5   | EXM  | execution phase (data transfer) |
//! | 4   | CB   | controller busy |
//! | 3-0 | DBx  | drive x busy seeking |

mod commands;
mod drive;

use std::fmt;

use commands::{Phase, ReadMode, RecvTarget, SendSource, WriteMode};
use drive::DiskUnit;

/// MSR: ready to exchange a byte.
pub const MSR_RQM: u8 = 0x80;
/// MSR: data direction, set when the next byte flows FDC→CPU.
pub const MSR_DIO: u8 = 0x40;
/// MSR: execution phase.
pub const MSR_EXM: u8 = 0x20;
/// MSR: controller busy.
pub const MSR_CB: u8 = 0x10;

/// ST0: interrupt code "abnormal termination".
pub const ST0_ABNORMAL: u8 = 0x40;
/// ST0: interrupt code "invalid command".
pub const ST0_INVALID: u8 = 0x80;
/// ST0: seek end.
pub const ST0_SEEK_END: u8 = 0x20;
/// ST0: drive not ready.
pub const ST0_NOT_READY: u8 = 0x08;
/// ST0: head address.
pub const ST0_HEAD: u8 = 0x04;

/// ST1: end of cylinder.
pub const ST1_END_OF_CYLINDER: u8 = 0x80;
/// ST1: data error (CRC in the ID or data field).
pub const ST1_DATA_ERROR: u8 = 0x20;
/// ST1: overrun, the host lost a byte.
pub const ST1_OVERRUN: u8 = 0x10;
/// ST1: no data, the addressed sector was not found.
pub const ST1_NO_DATA: u8 = 0x04;
/// ST1: not writable.
pub const ST1_NOT_WRITABLE: u8 = 0x02;
/// ST1: missing address mark.
pub const ST1_MISSING_AM: u8 = 0x01;

/// ST2: control mark, the data address mark did not match the command.
pub const ST2_CONTROL_MARK: u8 = 0x40;
/// ST2: data error in the data field.
pub const ST2_DATA_ERROR: u8 = 0x20;
/// ST2: wrong cylinder.
pub const ST2_WRONG_CYLINDER: u8 = 0x10;
/// ST2: bad cylinder (sector header carries C = 0xFF).
pub const ST2_BAD_CYLINDER: u8 = 0x02;
/// ST2: missing data address mark.
pub const ST2_MISSING_DAM: u8 = 0x01;

/// ST3: write protected.
pub const ST3_WRITE_PROTECT: u8 = 0x40;
/// ST3: drive ready.
pub const ST3_READY: u8 = 0x20;
/// ST3: head over track 0.
pub const ST3_TRACK0: u8 = 0x10;
/// ST3: head address.
pub const ST3_HEAD: u8 = 0x04;

/// Data-corruption strategy for sectors flagged as unreadable
/// (copy-protection tracks mark both data-error bits, or carry a head
/// mismatch). A real drive returns different garbage on every revolution;
/// loaders check that two reads differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RandomMethod {
    /// Corrupt the final byte, unless the sector matches one of the known
    /// titles that check the first byte instead.
    #[default]
    Auto,
    /// Always corrupt the final byte.
    FinalByte,
    /// Always corrupt the first byte.
    FirstByte,
    /// Return the sector zero-filled past its stored data, untouched.
    ZeroFill,
}

/// Head position snapshot for one drive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DriveState {
    /// Physical cylinder the head is over.
    pub track: u8,
    /// Head selected by the last command.
    pub head: u8,
    /// Physical sector index the head is over.
    pub sector: u8,
}

/// Controller snapshot returned by [`Upd765a::get_fdc_state`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FdcState {
    pub msr: u8,
    pub st0: u8,
    pub st1: u8,
    pub st2: u8,
    pub st3: u8,
    pub unit0: DriveState,
    pub unit1: DriveState,
}

/// NEC uPD765A floppy disk controller with two drive units.
pub struct Upd765a {
    /// Main Status Register, the byte on the status port.
    pub(crate) main_status: u8,
    /// Last byte exchanged through the data port.
    pub(crate) data_latch: u8,
    pub(crate) st0: u8,
    pub(crate) st1: u8,
    pub(crate) st2: u8,
    pub(crate) st3: u8,

    /// Continuation to run on the next qualifying port access.
    pub(crate) phase: Phase,
    /// Continuation entered when a receive/send run completes.
    pub(crate) return_after_transfer: Phase,
    /// Continuation entered after the 7 sector-command result bytes.
    pub(crate) buffer_return: Phase,
    /// Continuation entered after a sector's data reaches the CPU.
    pub(crate) sector_read_return: Phase,
    /// Continuation entered after a sector's data arrives from the CPU.
    pub(crate) sector_write_return: Phase,

    pub(crate) cmd_byte: u8,
    /// Low 5 bits of the last accepted command.
    pub(crate) last_cmd: u8,
    pub(crate) params: [u8; 32],
    pub(crate) results: [u8; 32],
    pub(crate) num_params: u8,
    pub(crate) num_results: u8,
    /// R parameter as issued, before multi-sector increments.
    pub(crate) original_r: u8,

    /// Receive engine cursor.
    pub(crate) rcv_target: RecvTarget,
    pub(crate) rcv_off: usize,
    pub(crate) rcv_count: u16,
    /// Send engine cursor.
    pub(crate) send_source: SendSource,
    pub(crate) send_off: usize,
    pub(crate) send_count: u16,

    /// Drive addressed by the current command.
    pub(crate) selected_unit: usize,
    /// Drive that last accepted Seek/Recalibrate, for Sense Interrupt.
    pub(crate) seek_unit: Option<usize>,
    pub(crate) seek_result: u8,
    pub(crate) tse_error: bool,
    /// Control-mark bit merged into ST2 during result assembly.
    pub(crate) st2_dam_bit: u8,
    pub(crate) valid_track: bool,
    /// Wraps of the sector list during the current search; the sector is
    /// missing once the head has seen the index hole twice.
    pub(crate) index_hole_count: u8,
    pub(crate) sectors_read: u8,
    pub(crate) sectors_transferred: u8,
    pub(crate) multi_sector: bool,
    pub(crate) read_mode: ReadMode,
    pub(crate) write_mode: WriteMode,
    /// 0 for normal data, 0x40 for deleted data commands.
    pub(crate) dam_mask: u8,
    /// Byte offset of the current Sector Information entry in the scratch
    /// track block.
    pub(crate) current_info: usize,
    /// Byte offset of the current sector's data in the scratch track block.
    pub(crate) current_data: usize,
    /// Stored sector length for this track's DSK layout.
    pub(crate) current_sector_size: u32,
    /// Transfer length implied by the command's N (or DTL).
    pub(crate) physical_sector_size: u32,
    /// Bytes actually present for the current sector.
    pub(crate) available_sector_data: u32,
    pub(crate) current_sector_number: u8,
    /// Post-seek settle: while nonzero, Read Sector ID reports sector 0.
    pub(crate) ret_csr0: u8,

    pub(crate) random_seed: u8,
    pub(crate) random_method: RandomMethod,
    /// Rotates through the copies of an overdumped sector.
    pub(crate) multiple_sector_pick: u32,
    pub(crate) random_buf: Box<[u8]>,

    pub(crate) motor_state: bool,
    pub(crate) new_motor_state: bool,
    /// Commands still accepted after motor-off; some titles (Scrabble
    /// Deluxe) issue reads while the motor is spinning down.
    pub(crate) motor_off_timer: u8,

    pub(crate) overrun_test: bool,
    pub(crate) overrun_counter: u8,
    pub(crate) overrun_error: bool,

    pub(crate) active_cb: Option<Box<dyn FnMut()>>,
    pub(crate) command_cb: Option<Box<dyn FnMut(&[u8])>>,

    pub(crate) units: [DiskUnit; 2],
}

impl Upd765a {
    /// Size of the bad-sector randomization buffer.
    const RANDOM_BUF_LEN: usize = 16384;

    /// Create a controller with no disks inserted.
    #[must_use]
    pub fn new() -> Self {
        let mut fdc = Self {
            main_status: 0,
            data_latch: 0,
            st0: 0,
            st1: 0,
            st2: 0,
            st3: 0,
            phase: Phase::AwaitCommand,
            return_after_transfer: Phase::AwaitCommand,
            buffer_return: Phase::AwaitCommand,
            sector_read_return: Phase::AwaitCommand,
            sector_write_return: Phase::AwaitCommand,
            cmd_byte: 0,
            last_cmd: 0,
            params: [0; 32],
            results: [0; 32],
            num_params: 0,
            num_results: 0,
            original_r: 0,
            rcv_target: RecvTarget::Params,
            rcv_off: 0,
            rcv_count: 0,
            send_source: SendSource::Results,
            send_off: 0,
            send_count: 0,
            selected_unit: 0,
            seek_unit: None,
            seek_result: 0,
            tse_error: false,
            st2_dam_bit: 0,
            valid_track: false,
            index_hole_count: 0,
            sectors_read: 0,
            sectors_transferred: 0,
            multi_sector: false,
            read_mode: ReadMode::Data,
            write_mode: WriteMode::Data,
            dam_mask: 0,
            current_info: 0,
            current_data: 0,
            current_sector_size: 0,
            physical_sector_size: 0,
            available_sector_data: 0,
            current_sector_number: 0,
            ret_csr0: 0,
            random_seed: 0,
            random_method: RandomMethod::Auto,
            multiple_sector_pick: 0,
            random_buf: vec![0; Self::RANDOM_BUF_LEN].into_boxed_slice(),
            motor_state: false,
            new_motor_state: false,
            motor_off_timer: 0,
            overrun_test: false,
            overrun_counter: 0,
            overrun_error: false,
            active_cb: None,
            command_cb: None,
            units: [DiskUnit::new(), DiskUnit::new()],
        };
        fdc.low_level_init();
        fdc
    }

    /// Reset the controller without ejecting the disks.
    pub fn reset_device(&mut self) {
        self.low_level_init();
    }

    /// Eject both drives.
    pub fn shutdown(&mut self) {
        self.eject_disk(0);
        self.eject_disk(1);
    }

    /// Mount a disk image in a drive. The previous disk, if any, is
    /// ejected first.
    ///
    /// Images whose first byte is `'E'` are normalized from EDSK into
    /// standard DSK layout; the normalized disk is always write-protected.
    /// If normalization cannot allocate its buffer the drive is left
    /// empty.
    pub fn insert_disk(&mut self, image: Vec<u8>, write_protect: bool, unit: u8) {
        self.units[usize::from(unit & 1)].insert(image, write_protect);
        self.low_level_init();
    }

    /// Remove the disk from a drive.
    pub fn eject_disk(&mut self, unit: u8) {
        self.units[usize::from(unit & 1)].eject();
        self.low_level_init();
    }

    #[must_use]
    pub fn disk_inserted(&self, unit: u8) -> bool {
        self.units[usize::from(unit & 1)].inserted
    }

    #[must_use]
    pub fn write_protected(&self, unit: u8) -> bool {
        self.units[usize::from(unit & 1)].write_protect
    }

    /// Whether the drive's disk has been written to since it was inserted.
    #[must_use]
    pub fn contents_changed(&self, unit: u8) -> bool {
        self.units[usize::from(unit & 1)].contents_changed
    }

    #[must_use]
    pub fn get_motor_state(&self) -> bool {
        self.motor_state
    }

    /// Update the motor latch from the host's control-port write; bit 3
    /// carries the motor state.
    ///
    /// Turning the motor off arms a short grace timer during which
    /// commands are still accepted, counted down one per trapped command.
    pub fn set_motor_state(&mut self, value: u8) {
        let new_state = value & 0x08 != 0;
        self.new_motor_state = new_state;
        if self.motor_state && !new_state {
            self.motor_off_timer = 3;
        }
        self.motor_state = new_state;
    }

    /// Read the Main Status Register.
    ///
    /// While a send is in progress this is also the overrun watchdog:
    /// each poll that does not consume the pending byte decrements the
    /// counter, and when it expires the transfer is abandoned with
    /// ST0 = abnormal termination and ST1 overrun set.
    pub fn status_port_read(&mut self) -> u8 {
        if self.overrun_test {
            if self.overrun_counter == 0 {
                self.overrun_test = false;
                self.overrun_error = true;
                self.st0 = (self.st0 & 0x3F) | ST0_ABNORMAL;
                self.st1 |= ST1_OVERRUN;
                // Clear execution mode before running the continuation;
                // the result path keys off it (Italia 1990).
                self.main_status &= !MSR_EXM;
                let continuation = self.return_after_transfer;
                self.phase = continuation;
                self.run(continuation);
            } else {
                self.overrun_counter -= 1;
            }
        }
        self.main_status
    }

    /// Read the data register.
    ///
    /// When the MSR announces an FDC→CPU byte, the machine advances and
    /// the fresh byte is returned; otherwise the stale latch contents come
    /// back.
    pub fn data_port_read(&mut self) -> u8 {
        if self.main_status & (MSR_RQM | MSR_DIO) == MSR_RQM | MSR_DIO {
            let phase = self.phase;
            self.run(phase);
        }
        self.data_latch
    }

    /// Write the data register.
    ///
    /// The byte is latched unconditionally; the machine only advances
    /// when the MSR announces it expects a CPU→FDC byte.
    pub fn data_port_write(&mut self, value: u8) {
        self.data_latch = value;
        if self.main_status & (MSR_RQM | MSR_DIO) == MSR_RQM {
            let phase = self.phase;
            self.run(phase);
        }
    }

    /// Install a callback invoked when a disk command starts executing,
    /// so hosts can drop emulation overhead during disk access.
    pub fn set_active_callback(&mut self, callback: impl FnMut() + 'static) {
        self.active_cb = Some(Box::new(callback));
    }

    /// Install a callback receiving the command byte and its parameters
    /// at documented points (1, 2, 3, 6 or 9 bytes).
    pub fn set_command_callback(&mut self, callback: impl FnMut(&[u8]) + 'static) {
        self.command_cb = Some(Box::new(callback));
    }

    /// Select the bad-sector randomization strategy: 0 auto, 1 final
    /// byte, 2 first byte, 255 zero-fill. Other values are ignored.
    pub fn set_random_method(&mut self, method: u8) {
        self.random_method = match method {
            0 => RandomMethod::Auto,
            1 => RandomMethod::FinalByte,
            2 => RandomMethod::FirstByte,
            255 => RandomMethod::ZeroFill,
            _ => return,
        };
    }

    /// Snapshot the externally visible controller state.
    #[must_use]
    pub fn get_fdc_state(&self) -> FdcState {
        let unit_state = |unit: &DiskUnit| DriveState {
            track: unit.ctk,
            head: unit.chead,
            sector: unit.csr,
        };
        FdcState {
            msr: self.main_status,
            st0: self.st0,
            st1: self.st1,
            st2: self.st2,
            st3: self.st3,
            unit0: unit_state(&self.units[0]),
            unit1: unit_state(&self.units[1]),
        }
    }

    /// Power-on / reset state: motor off, heads home, ready line up,
    /// waiting for a command byte.
    pub(crate) fn low_level_init(&mut self) {
        self.motor_state = false;
        self.phase = Phase::AwaitCommand;
        self.main_status = MSR_RQM;
        for unit in &mut self.units {
            unit.seek_done = false;
            unit.ctk = 0;
            unit.chead = 0;
        }
        self.st3 |= ST3_READY;
        self.random_seed = 0;
    }

    pub(crate) fn unit(&self) -> &DiskUnit {
        &self.units[self.selected_unit]
    }

    pub(crate) fn unit_mut(&mut self) -> &mut DiskUnit {
        &mut self.units[self.selected_unit]
    }

    pub(crate) fn notify_active(&mut self) {
        if let Some(callback) = self.active_cb.as_mut() {
            callback();
        }
    }

    /// Hand the command byte plus `count - 1` parameter bytes to the host.
    pub(crate) fn command_callback(&mut self, count: usize) {
        let mut bytes = [0u8; 10];
        bytes[0] = self.cmd_byte;
        bytes[1..count].copy_from_slice(&self.params[..count - 1]);
        if let Some(callback) = self.command_cb.as_mut() {
            callback(&bytes[..count]);
        }
    }
}

impl Default for Upd765a {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Upd765a {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upd765a")
            .field("msr", &self.main_status)
            .field("phase", &self.phase)
            .field("st0", &self.st0)
            .field("st1", &self.st1)
            .field("st2", &self.st2)
            .field("st3", &self.st3)
            .field("last_cmd", &self.last_cmd)
            .field("read_mode", &self.read_mode)
            .field("write_mode", &self.write_mode)
            .field("num_params", &self.num_params)
            .field("num_results", &self.num_results)
            .field("original_r", &self.original_r)
            .field("sectors_transferred", &self.sectors_transferred)
            .field("new_motor_state", &self.new_motor_state)
            .field("overrun_error", &self.overrun_error)
            .finish_non_exhaustive()
    }
}
