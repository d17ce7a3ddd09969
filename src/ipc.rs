//! Inter-processor communication: `IPCSYNC` (a 4-bit value each core can
//! push to the other, with an optional IRQ), and a pair of 16-deep word
//! FIFOs (one per direction) behind `IPCFIFOCNT`.

use crate::cpu::interrupt::InterruptController;

const IPC_SYNC_IRQ: u32 = 16;
const IPC_SEND_FIFO_EMPTY_IRQ: u32 = 17;
const IPC_RECV_FIFO_NOT_EMPTY_IRQ: u32 = 18;

proc_bitfield::bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Sync(pub u16): Debug {
        pub recv: u8 @ 0..=3,
        pub send: u8 @ 8..=11,
        pub send_irq: bool @ 13,
        pub irq_enabled: bool @ 14,
    }
}

proc_bitfield::bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct FifoControl(pub u16): Debug {
        pub send_fifo_empty: bool @ 0,
        pub send_fifo_full: bool @ 1,
        pub send_fifo_empty_irq_enabled: bool @ 2,
        pub clear_send_fifo: bool @ 3,
        pub recv_fifo_empty: bool @ 8,
        pub recv_fifo_full: bool @ 9,
        pub recv_fifo_not_empty_irq_enabled: bool @ 10,
        pub error: bool @ 14,
        pub fifos_enabled: bool @ 15,
    }
}

/// A fixed-capacity ring buffer of 32-bit words backing one direction's
/// FIFO; reads past empty repeat the last value, matching the real
/// hardware's "stuck at last value" underflow behavior.
struct Fifo16 {
    buf: [u32; 16],
    head: usize,
    len: usize,
}

impl Fifo16 {
    const fn new() -> Self {
        Fifo16 {
            buf: [0; 16],
            head: 0,
            len: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn is_full(&self) -> bool {
        self.len == 16
    }

    fn clear(&mut self) {
        self.len = 0;
        self.head = 0;
    }

    fn write(&mut self, value: u32) -> Option<()> {
        if self.is_full() {
            return None;
        }
        self.buf[(self.head + self.len) % 16] = value;
        self.len += 1;
        Some(())
    }

    fn read(&mut self) -> Option<u32> {
        if self.is_empty() {
            return None;
        }
        let value = self.buf[self.head];
        self.head = (self.head + 1) % 16;
        self.len -= 1;
        Some(value)
    }

    fn peek(&self) -> Option<u32> {
        if self.is_empty() {
            None
        } else {
            Some(self.buf[self.head])
        }
    }
}

pub struct Ipc {
    sync_7: Sync,
    sync_9: Sync,
    fifo_control_7: FifoControl,
    fifo_control_9: FifoControl,
    /// Filled by ARM7, drained by ARM9.
    arm7_to_arm9: Fifo16,
    /// Filled by ARM9, drained by ARM7.
    arm9_to_arm7: Fifo16,
    last_recv_7: u32,
    last_recv_9: u32,
}

impl Ipc {
    pub fn new() -> Self {
        Ipc {
            sync_7: Sync(0),
            sync_9: Sync(0),
            fifo_control_7: FifoControl(0x0101),
            fifo_control_9: FifoControl(0x0101),
            arm7_to_arm9: Fifo16::new(),
            arm9_to_arm7: Fifo16::new(),
            last_recv_7: 0,
            last_recv_9: 0,
        }
    }

    #[inline]
    pub fn sync_7(&self) -> Sync {
        self.sync_7
    }

    #[inline]
    pub fn sync_9(&self) -> Sync {
        self.sync_9
    }

    pub fn write_sync_7(&mut self, value: Sync, arm9_irqs: &mut InterruptController) {
        self.sync_7.set_raw((self.sync_7.raw() & 0x000F) | (value.raw() & 0x4F00));
        self.sync_9.set_raw((self.sync_9.raw() & 0x4F00) | ((value.raw() >> 8) & 0xF));
        if value.send_irq() && self.sync_9.irq_enabled() {
            arm9_irqs.raise(IPC_SYNC_IRQ);
        }
    }

    pub fn write_sync_9(&mut self, value: Sync, arm7_irqs: &mut InterruptController) {
        self.sync_9.set_raw((self.sync_9.raw() & 0x000F) | (value.raw() & 0x4F00));
        self.sync_7.set_raw((self.sync_7.raw() & 0x4F00) | ((value.raw() >> 8) & 0xF));
        if value.send_irq() && self.sync_7.irq_enabled() {
            arm7_irqs.raise(IPC_SYNC_IRQ);
        }
    }

    #[inline]
    pub fn fifo_control_7(&self) -> FifoControl {
        self.fifo_control_7
    }

    #[inline]
    pub fn fifo_control_9(&self) -> FifoControl {
        self.fifo_control_9
    }

    pub fn write_fifo_control_7(&mut self, value: FifoControl) {
        if value.clear_send_fifo() {
            self.arm7_to_arm9.clear();
            self.fifo_control_7 = self
                .fifo_control_7
                .with_send_fifo_empty(true)
                .with_send_fifo_full(false);
            self.fifo_control_9 = self
                .fifo_control_9
                .with_recv_fifo_empty(true)
                .with_recv_fifo_full(false);
            self.last_recv_9 = 0;
        }
        self.fifo_control_7
            .set_raw(((self.fifo_control_7.raw() & 0x4303) | (value.raw() & 0x8404)) & !(value.raw() & 0x4000));
    }

    pub fn write_fifo_control_9(&mut self, value: FifoControl) {
        if value.clear_send_fifo() {
            self.arm9_to_arm7.clear();
            self.fifo_control_9 = self
                .fifo_control_9
                .with_send_fifo_empty(true)
                .with_send_fifo_full(false);
            self.fifo_control_7 = self
                .fifo_control_7
                .with_recv_fifo_empty(true)
                .with_recv_fifo_full(false);
            self.last_recv_7 = 0;
        }
        self.fifo_control_9
            .set_raw(((self.fifo_control_9.raw() & 0x4303) | (value.raw() & 0x8404)) & !(value.raw() & 0x4000));
    }

    /// ARM7 pushes one word for ARM9 to read.
    pub fn send_7(&mut self, value: u32, arm9_irqs: &mut InterruptController) {
        if !self.fifo_control_7.fifos_enabled() {
            return;
        }
        if self.arm7_to_arm9.write(value).is_none() {
            self.fifo_control_7.set_error(true);
            return;
        }
        self.fifo_control_7 = self
            .fifo_control_7
            .with_send_fifo_empty(false)
            .with_send_fifo_full(self.arm7_to_arm9.is_full());
        let was_empty_before_push = self.arm7_to_arm9.len == 1;
        self.fifo_control_9 = self
            .fifo_control_9
            .with_recv_fifo_empty(false)
            .with_recv_fifo_full(self.arm7_to_arm9.is_full());
        if self.fifo_control_9.recv_fifo_not_empty_irq_enabled() && was_empty_before_push {
            arm9_irqs.raise(IPC_RECV_FIFO_NOT_EMPTY_IRQ);
        }
    }

    /// ARM9 pushes one word for ARM7 to read.
    pub fn send_9(&mut self, value: u32, arm7_irqs: &mut InterruptController) {
        if !self.fifo_control_9.fifos_enabled() {
            return;
        }
        if self.arm9_to_arm7.write(value).is_none() {
            self.fifo_control_9.set_error(true);
            return;
        }
        self.fifo_control_9 = self
            .fifo_control_9
            .with_send_fifo_empty(false)
            .with_send_fifo_full(self.arm9_to_arm7.is_full());
        let was_empty_before_push = self.arm9_to_arm7.len == 1;
        self.fifo_control_7 = self
            .fifo_control_7
            .with_recv_fifo_empty(false)
            .with_recv_fifo_full(self.arm9_to_arm7.is_full());
        if self.fifo_control_7.recv_fifo_not_empty_irq_enabled() && was_empty_before_push {
            arm7_irqs.raise(IPC_RECV_FIFO_NOT_EMPTY_IRQ);
        }
    }

    /// Restores the register halves of a savestate; the FIFOs themselves
    /// come back empty, a queued message is transient state nobody expects
    /// a savestate to replay.
    pub fn restore_registers(
        &mut self,
        sync_7: Sync,
        sync_9: Sync,
        fifo_control_7: FifoControl,
        fifo_control_9: FifoControl,
    ) {
        self.sync_7 = sync_7;
        self.sync_9 = sync_9;
        self.fifo_control_7 = fifo_control_7
            .with_send_fifo_empty(true)
            .with_send_fifo_full(false);
        self.fifo_control_9 = fifo_control_9
            .with_send_fifo_empty(true)
            .with_send_fifo_full(false);
        self.arm7_to_arm9.clear();
        self.arm9_to_arm7.clear();
        self.last_recv_7 = 0;
        self.last_recv_9 = 0;
    }

    #[inline]
    pub fn peek_7(&self) -> u32 {
        self.arm9_to_arm7.peek().unwrap_or(self.last_recv_7)
    }

    /// ARM7 pops the word ARM9 sent it.
    pub fn recv_7(&mut self, arm9_irqs: &mut InterruptController) -> u32 {
        if !self.fifo_control_7.fifos_enabled() {
            return self.peek_7();
        }
        match self.arm9_to_arm7.read() {
            Some(value) => {
                self.fifo_control_7 = self
                    .fifo_control_7
                    .with_recv_fifo_full(false)
                    .with_recv_fifo_empty(self.arm9_to_arm7.is_empty());
                self.fifo_control_9 = self
                    .fifo_control_9
                    .with_send_fifo_full(false)
                    .with_send_fifo_empty(self.arm9_to_arm7.is_empty());
                if self.fifo_control_9.send_fifo_empty_irq_enabled() && self.arm9_to_arm7.is_empty() {
                    arm9_irqs.raise(IPC_SEND_FIFO_EMPTY_IRQ);
                }
                self.last_recv_7 = value;
                value
            }
            None => {
                self.fifo_control_7.set_error(true);
                self.last_recv_7
            }
        }
    }

    #[inline]
    pub fn peek_9(&self) -> u32 {
        self.arm7_to_arm9.peek().unwrap_or(self.last_recv_9)
    }

    /// ARM9 pops the word ARM7 sent it.
    pub fn recv_9(&mut self, arm7_irqs: &mut InterruptController) -> u32 {
        if !self.fifo_control_9.fifos_enabled() {
            return self.peek_9();
        }
        match self.arm7_to_arm9.read() {
            Some(value) => {
                self.fifo_control_9 = self
                    .fifo_control_9
                    .with_recv_fifo_full(false)
                    .with_recv_fifo_empty(self.arm7_to_arm9.is_empty());
                self.fifo_control_7 = self
                    .fifo_control_7
                    .with_send_fifo_full(false)
                    .with_send_fifo_empty(self.arm7_to_arm9.is_empty());
                if self.fifo_control_7.send_fifo_empty_irq_enabled() && self.arm7_to_arm9.is_empty() {
                    arm7_irqs.raise(IPC_SEND_FIFO_EMPTY_IRQ);
                }
                self.last_recv_9 = value;
                value
            }
            None => {
                self.fifo_control_9.set_error(true);
                self.last_recv_9
            }
        }
    }
}

impl Default for Ipc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_7_then_recv_9_round_trips() {
        let mut ipc = Ipc::new();
        ipc.write_fifo_control_7(FifoControl(0).with_fifos_enabled(true));
        ipc.write_fifo_control_9(FifoControl(0).with_fifos_enabled(true));
        let mut arm9_irqs = InterruptController::new(false);
        ipc.send_7(0x1234_5678, &mut arm9_irqs);
        let mut arm7_irqs = InterruptController::new(false);
        assert_eq!(ipc.recv_9(&mut arm7_irqs), 0x1234_5678);
    }

    #[test]
    fn recv_past_empty_repeats_last_value() {
        let mut ipc = Ipc::new();
        ipc.write_fifo_control_7(FifoControl(0).with_fifos_enabled(true));
        ipc.write_fifo_control_9(FifoControl(0).with_fifos_enabled(true));
        let mut arm9_irqs = InterruptController::new(false);
        ipc.send_7(42, &mut arm9_irqs);
        let mut arm7_irqs = InterruptController::new(false);
        assert_eq!(ipc.recv_9(&mut arm7_irqs), 42);
        assert_eq!(ipc.recv_9(&mut arm7_irqs), 42);
        assert!(ipc.fifo_control_9().error());
    }

    #[test]
    fn sync_send_irq_notifies_other_core_when_enabled() {
        let mut ipc = Ipc::new();
        // ARM7 opts in to being woken by the next SYNC send from ARM9.
        ipc.write_sync_7(Sync(0).with_irq_enabled(true), &mut InterruptController::new(false));
        let mut arm7_irqs = InterruptController::new(false);
        arm7_irqs.write_ie(crate::cpu::interrupt::IrqFlags(0).with_ipc_sync(true));
        arm7_irqs.write_ime(true);
        ipc.write_sync_9(Sync(0).with_send_irq(true), &mut arm7_irqs);
        assert!(arm7_irqs.poll());
    }
}
