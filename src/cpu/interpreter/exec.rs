//! Fetch-decode-execute glue tying the ARM/Thumb decode tables and
//! execution primitives in [`super::arm`]/[`super::thumb`] into a single
//! instruction step.
//!
//! The two-stage prefetch buffer on [`Registers`] is flushed on every
//! taken branch but never otherwise inspected here: nothing in this crate
//! reads its contents, so `step` treats it as a no-op bookkeeping field
//! and instead folds the ARM7TDMI's "PC reads as address+8 (ARM) or +4
//! (Thumb)" rule directly into operand decoding, which is
//! observationally identical for every instruction this core executes.

use super::arm::{self, ArmOp, DpOpcode, Shift};
use super::thumb::{self, ThumbOp};
use super::{condition_passes, Bus};
use crate::cpu::psr::Mode;
use crate::cpu::Registers;

/// What happened on this [`step`] that the caller (which owns IRQ state,
/// `IntrWaitState` and the HLE BIOS tables) needs to react to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepEvent {
    Normal,
    /// `SWI`/`swi` executed; the operand is the raw immediate (ARM: bits
    /// 23..=16, Thumb: imm8). The caller dispatches through
    /// [`super::swi::Swi::decode`] and resumes execution at `LR` with the
    /// BIOS return values already written into `regs` by the caller.
    SoftwareInterrupt(u8),
    /// Hit an undefined encoding; the caller may choose to raise the
    /// `Undefined` exception or (for HLE BIOS calls encoded as
    /// permanently-undefined instructions in some homebrew) special-case it.
    Undefined,
}

#[inline]
fn pc_arm(regs: &Registers) -> u32 {
    regs.gpr[15].wrapping_add(8)
}

#[inline]
fn pc_thumb(regs: &Registers) -> u32 {
    regs.gpr[15].wrapping_add(4)
}

#[inline]
fn branch_to(regs: &mut Registers, target: u32, thumb: bool) {
    regs.cpsr.set_thumb_state(thumb);
    regs.gpr[15] = if thumb { target & !1 } else { target & !3 };
    regs.flush_pipeline();
}

/// Decodes and executes one ARM-state instruction at `regs.gpr[15]`,
/// leaving `gpr[15]` pointing at the next instruction to fetch (i.e. the
/// caller never needs to add the instruction width itself).
pub fn step_arm(regs: &mut Registers, bus: &mut impl Bus, is_arm9: bool) -> StepEvent {
    let instr = bus.read32(regs.gpr[15]);
    let cond = (instr >> 28) as u8;
    if !condition_passes(cond, regs.cpsr) {
        regs.gpr[15] = regs.gpr[15].wrapping_add(4);
        return StepEvent::Normal;
    }

    let op = arm::decode_table().lookup(instr);
    let event = match op {
        ArmOp::SoftwareInterrupt => {
            let comment = ((instr >> 16) & 0xFF) as u8;
            regs.gpr[15] = regs.gpr[15].wrapping_add(4);
            return StepEvent::SoftwareInterrupt(comment);
        }
        ArmOp::Undefined => StepEvent::Undefined,
        ArmOp::BranchExchange => {
            exec_branch_exchange(regs, instr);
            StepEvent::Normal
        }
        ArmOp::Branch => {
            exec_branch(regs, instr);
            StepEvent::Normal
        }
        ArmOp::DataProcessing => {
            exec_data_processing_instr(regs, instr, is_arm9);
            StepEvent::Normal
        }
        ArmOp::Multiply => {
            exec_multiply_instr(regs, instr);
            StepEvent::Normal
        }
        ArmOp::MultiplyLong => {
            exec_multiply_long_instr(regs, instr);
            StepEvent::Normal
        }
        ArmOp::SingleTransfer => {
            exec_single_transfer_instr(regs, bus, instr);
            StepEvent::Normal
        }
        ArmOp::HalfwordTransfer => {
            exec_halfword_transfer_instr(regs, bus, instr);
            StepEvent::Normal
        }
        ArmOp::BlockTransfer => {
            exec_block_transfer_instr(regs, bus, instr, is_arm9);
            StepEvent::Normal
        }
    };

    // Branches (and BX) set PC themselves via `branch_to`; everything else
    // falls through to the next word.
    if !matches!(op, ArmOp::Branch | ArmOp::BranchExchange) {
        regs.gpr[15] = regs.gpr[15].wrapping_add(4);
    }
    event
}

/// Operand-2 decode for the data-processing class: either an immediate
/// (rotated 8-bit) or a shifted register, returning `(value, shifter_carry)`.
fn decode_operand2(regs: &Registers, instr: u32, pc: u32) -> (u32, bool) {
    if instr & (1 << 25) != 0 {
        let imm = instr & 0xFF;
        let rotate = ((instr >> 8) & 0xF) * 2;
        let (value, carry) = arm::barrel_shift(Shift::Ror, imm, rotate, regs.cpsr.carry());
        return (value, if rotate == 0 { regs.cpsr.carry() } else { carry });
    }

    let rm = (instr & 0xF) as usize;
    let rm_value = if rm == 15 { pc } else { regs.gpr[rm] };
    let shift = match (instr >> 5) & 0b11 {
        0 => Shift::Lsl,
        1 => Shift::Lsr,
        2 => Shift::Asr,
        _ => Shift::Ror,
    };

    let (amount, is_reg_count) = if instr & (1 << 4) != 0 {
        let rs = ((instr >> 8) & 0xF) as usize;
        (regs.gpr[rs] & 0xFF, true)
    } else {
        (((instr >> 7) & 0x1F), false)
    };

    if !is_reg_count && amount == 0 {
        // LSR/ASR #32 and ROR #32 (RRX) special-case the zero immediate.
        return match shift {
            Shift::Lsl => (rm_value, regs.cpsr.carry()),
            Shift::Lsr => arm::barrel_shift(Shift::Lsr, rm_value, 32, regs.cpsr.carry()),
            Shift::Asr => arm::barrel_shift(Shift::Asr, rm_value, 32, regs.cpsr.carry()),
            Shift::Ror => {
                let carry_in = regs.cpsr.carry() as u32;
                ((rm_value >> 1) | (carry_in << 31), rm_value & 1 != 0)
            }
        };
    }
    if is_reg_count && amount == 0 {
        return (rm_value, regs.cpsr.carry());
    }
    arm::barrel_shift(shift, rm_value, amount, regs.cpsr.carry())
}

fn exec_data_processing_instr(regs: &mut Registers, instr: u32, is_arm9: bool) {
    let op = DpOpcode::decode(((instr >> 21) & 0xF) as u8);
    let set_flags = instr & (1 << 20) != 0;
    let rn = ((instr >> 16) & 0xF) as usize;
    let rd = ((instr >> 12) & 0xF) as usize;
    let pc = pc_arm(regs);
    let rn_value = if rn == 15 { pc } else { regs.gpr[rn] };
    let (operand2, shifter_carry) = decode_operand2(regs, instr, pc);

    arm::exec_data_processing(regs, op, rd, rn_value, operand2, shifter_carry, set_flags);

    if set_flags && rd == 15 {
        // `MOVS pc, lr` / any S-flagged write to r15 restores CPSR from
        // SPSR, the exception-return idiom.
        let spsr = regs.spsr();
        regs.cpsr = spsr.masked(is_arm9);
        regs.switch_mode(regs.cpsr.mode_enum());
    }
    if rd == 15 {
        branch_to(regs, regs.gpr[15], regs.cpsr.thumb_state());
    }
}

fn exec_multiply_instr(regs: &mut Registers, instr: u32) {
    let rd = ((instr >> 16) & 0xF) as usize;
    let rn = ((instr >> 12) & 0xF) as usize;
    let rs = ((instr >> 8) & 0xF) as usize;
    let rm = (instr & 0xF) as usize;
    let accumulate = instr & (1 << 21) != 0;
    let set_flags = instr & (1 << 20) != 0;
    arm::exec_multiply(regs, rd, rm, rs, accumulate.then_some(rn), set_flags);
}

fn exec_multiply_long_instr(regs: &mut Registers, instr: u32) {
    let rd_hi = ((instr >> 16) & 0xF) as usize;
    let rd_lo = ((instr >> 12) & 0xF) as usize;
    let rs = ((instr >> 8) & 0xF) as usize;
    let rm = (instr & 0xF) as usize;
    let signed = instr & (1 << 22) != 0;
    let accumulate = instr & (1 << 21) != 0;
    let set_flags = instr & (1 << 20) != 0;
    arm::exec_multiply_long(regs, rd_hi, rd_lo, rm, rs, signed, accumulate, set_flags);
}

fn exec_single_transfer_instr(regs: &mut Registers, bus: &mut impl Bus, instr: u32) {
    let pre_index = instr & (1 << 24) != 0;
    let add = instr & (1 << 23) != 0;
    let is_byte = instr & (1 << 22) != 0;
    let writeback_force = instr & (1 << 21) != 0;
    let is_load = instr & (1 << 20) != 0;

    let rn = ((instr >> 16) & 0xF) as usize;
    let rd = ((instr >> 12) & 0xF) as usize;
    let pc = pc_arm(regs);
    let base = if rn == 15 { pc } else { regs.gpr[rn] };

    let offset = if instr & (1 << 25) != 0 {
        let rm = (instr & 0xF) as usize;
        let rm_value = regs.gpr[rm];
        let shift = match (instr >> 5) & 0b11 {
            0 => Shift::Lsl,
            1 => Shift::Lsr,
            2 => Shift::Asr,
            _ => Shift::Ror,
        };
        let amount = (instr >> 7) & 0x1F;
        arm::barrel_shift(shift, rm_value, amount, regs.cpsr.carry()).0
    } else {
        instr & 0xFFF
    };

    let indexed_addr = if add { base.wrapping_add(offset) } else { base.wrapping_sub(offset) };
    let effective_addr = if pre_index { indexed_addr } else { base };

    let mut value = if is_load { 0 } else { regs.gpr[rd] };
    if !is_load && rd == 15 {
        value = pc;
    }
    arm::exec_single_transfer(bus, effective_addr, &mut value, is_load, is_byte);
    if is_load {
        regs.gpr[rd] = value;
    }

    if !pre_index || writeback_force {
        regs.gpr[rn] = indexed_addr;
    }
    if is_load && rd == 15 {
        branch_to(regs, regs.gpr[15], false);
    }
}

fn exec_halfword_transfer_instr(regs: &mut Registers, bus: &mut impl Bus, instr: u32) {
    let pre_index = instr & (1 << 24) != 0;
    let add = instr & (1 << 23) != 0;
    let immediate_offset = instr & (1 << 22) != 0;
    let writeback = instr & (1 << 21) != 0;
    let is_load = instr & (1 << 20) != 0;
    let rn = ((instr >> 16) & 0xF) as usize;
    let rd = ((instr >> 12) & 0xF) as usize;
    let sh = (instr >> 5) & 0b11;

    let base = regs.gpr[rn];
    let offset = if immediate_offset {
        ((instr >> 4) & 0xF0) | (instr & 0xF)
    } else {
        let rm = (instr & 0xF) as usize;
        regs.gpr[rm]
    };
    let indexed = if add { base.wrapping_add(offset) } else { base.wrapping_sub(offset) };
    let addr = if pre_index { indexed } else { base };

    if is_load {
        let value = match sh {
            0b01 => bus.read16(addr) as u32,
            0b10 => (bus.read8(addr) as i8) as i32 as u32,
            0b11 => (bus.read16(addr) as i16) as i32 as u32,
            _ => 0,
        };
        regs.gpr[rd] = value;
    } else {
        bus.write16(addr, regs.gpr[rd] as u16);
    }

    if !pre_index || writeback {
        regs.gpr[rn] = indexed;
    }
}

fn exec_block_transfer_instr(regs: &mut Registers, bus: &mut impl Bus, instr: u32, is_arm9: bool) {
    let pre_index = instr & (1 << 24) != 0;
    let add = instr & (1 << 23) != 0;
    let user_bank = instr & (1 << 22) != 0;
    let writeback = instr & (1 << 21) != 0;
    let is_load = instr & (1 << 20) != 0;
    let rn = ((instr >> 16) & 0xF) as usize;
    let reg_list = instr & 0xFFFF;

    let count = reg_list.count_ones().max(1);
    let base = regs.gpr[rn];
    let start = if add { base } else { base.wrapping_sub(count * 4) };
    // First transferred word's address for each of the four IA/IB/DA/DB
    // addressing modes.
    let mut addr = match (add, pre_index) {
        (true, true) => base.wrapping_add(4),
        (true, false) => base,
        (false, true) => start,
        (false, false) => start.wrapping_add(4),
    };

    let original_mode = regs.mode();
    let switch_to_user = user_bank && !(is_load && reg_list & (1 << 15) != 0);
    if switch_to_user {
        regs.switch_mode(Mode::User);
    }

    for reg in 0..16 {
        if reg_list & (1 << reg) == 0 {
            continue;
        }
        if is_load {
            let value = bus.read32(addr);
            regs.gpr[reg] = value;
            if reg == 15 {
                if user_bank {
                    let spsr = regs.spsr();
                    regs.cpsr = spsr.masked(is_arm9);
                    regs.switch_mode(regs.cpsr.mode_enum());
                }
                branch_to(regs, value, regs.cpsr.thumb_state());
            }
        } else {
            let value = if reg == 15 { regs.gpr[15].wrapping_add(4) } else { regs.gpr[reg] };
            bus.write32(addr, value);
        }
        addr = addr.wrapping_add(4);
    }

    if switch_to_user {
        regs.switch_mode(original_mode);
    }
    if writeback {
        regs.gpr[rn] = if add { base.wrapping_add(count * 4) } else { base.wrapping_sub(count * 4) };
    }
}

fn exec_branch(regs: &mut Registers, instr: u32) {
    let link = instr & (1 << 24) != 0;
    let offset = thumb::sign_extend_offset(instr & 0x00FF_FFFF, 24) << 2;
    let pc = pc_arm(regs);
    if link {
        regs.gpr[14] = regs.gpr[15].wrapping_add(4);
    }
    branch_to(regs, pc.wrapping_add(offset as u32), false);
}

fn exec_branch_exchange(regs: &mut Registers, instr: u32) {
    let rm = (instr & 0xF) as usize;
    let target = regs.gpr[rm];
    let link = (instr >> 4) & 0xF == 0b0011;
    if link {
        regs.gpr[14] = regs.gpr[15].wrapping_add(4);
    }
    branch_to(regs, target, target & 1 != 0);
}

/// Decodes and executes one Thumb-state instruction. Most handlers just
/// mutate registers/memory and let the tail below advance `gpr[15]` by one
/// halfword; the handful that can branch (`BX`-via-`MOV pc`, conditional/
/// unconditional/long branches, `POP {pc}`) set it themselves and report
/// that through their `bool` return so the tail skips the default advance.
pub fn step_thumb(regs: &mut Registers, bus: &mut impl Bus, is_arm9: bool) -> StepEvent {
    let instr = bus.read16(regs.gpr[15]);
    let op = thumb::decode_table().lookup(instr);

    let (event, pc_already_set) = match op {
        ThumbOp::SoftwareInterrupt => {
            let comment = (instr & 0xFF) as u8;
            regs.gpr[15] = regs.gpr[15].wrapping_add(2);
            return StepEvent::SoftwareInterrupt(comment);
        }
        ThumbOp::Undefined => (StepEvent::Undefined, false),
        ThumbOp::MoveShifted => {
            exec_thumb_move_shifted(regs, instr);
            (StepEvent::Normal, false)
        }
        ThumbOp::AddSubtract => {
            exec_thumb_add_subtract(regs, instr);
            (StepEvent::Normal, false)
        }
        ThumbOp::AluImmediate => {
            exec_thumb_alu_immediate(regs, instr);
            (StepEvent::Normal, false)
        }
        ThumbOp::AluRegister => {
            exec_thumb_alu_register(regs, instr);
            (StepEvent::Normal, false)
        }
        ThumbOp::HiRegisterOps => {
            let branched = exec_thumb_hi_register_ops(regs, instr);
            (StepEvent::Normal, branched)
        }
        ThumbOp::PcRelativeLoad => {
            exec_thumb_pc_relative_load(regs, bus, instr);
            (StepEvent::Normal, false)
        }
        ThumbOp::LoadStoreRegisterOffset => {
            exec_thumb_load_store_register_offset(regs, bus, instr);
            (StepEvent::Normal, false)
        }
        ThumbOp::LoadStoreSignExtended => {
            exec_thumb_load_store_sign_extended(regs, bus, instr);
            (StepEvent::Normal, false)
        }
        ThumbOp::LoadStoreImmediateOffset => {
            exec_thumb_load_store_immediate_offset(regs, bus, instr);
            (StepEvent::Normal, false)
        }
        ThumbOp::LoadStoreHalfword => {
            exec_thumb_load_store_halfword(regs, bus, instr);
            (StepEvent::Normal, false)
        }
        ThumbOp::SpRelativeLoadStore => {
            exec_thumb_sp_relative_load_store(regs, bus, instr);
            (StepEvent::Normal, false)
        }
        ThumbOp::LoadAddress => {
            exec_thumb_load_address(regs, instr);
            (StepEvent::Normal, false)
        }
        ThumbOp::AddOffsetToSp => {
            exec_thumb_add_offset_to_sp(regs, instr);
            (StepEvent::Normal, false)
        }
        ThumbOp::PushPop => {
            let branched = exec_thumb_push_pop(regs, bus, instr);
            (StepEvent::Normal, branched)
        }
        ThumbOp::MultipleLoadStore => {
            exec_thumb_multiple_load_store(regs, bus, instr);
            (StepEvent::Normal, false)
        }
        ThumbOp::ConditionalBranch => {
            let branched = exec_thumb_conditional_branch(regs, instr);
            (StepEvent::Normal, branched)
        }
        ThumbOp::UnconditionalBranch => {
            exec_thumb_unconditional_branch(regs, instr);
            (StepEvent::Normal, true)
        }
        ThumbOp::LongBranchWithLink => {
            exec_thumb_long_branch_with_link(regs, instr);
            (StepEvent::Normal, true)
        }
    };

    if !pc_already_set {
        regs.gpr[15] = regs.gpr[15].wrapping_add(2);
    }
    let _ = is_arm9;
    event
}

fn exec_thumb_move_shifted(regs: &mut Registers, instr: u16) {
    let op = (instr >> 11) & 0b11;
    let amount = ((instr >> 6) & 0x1F) as u32;
    let rs = ((instr >> 3) & 0b111) as usize;
    let rd = (instr & 0b111) as usize;
    let shift = match op {
        0 => Shift::Lsl,
        1 => Shift::Lsr,
        _ => Shift::Asr,
    };
    let value = regs.gpr[rs];
    let (result, carry) = if amount == 0 {
        match shift {
            Shift::Lsl => (value, regs.cpsr.carry()),
            Shift::Lsr => arm::barrel_shift(Shift::Lsr, value, 32, regs.cpsr.carry()),
            Shift::Asr => arm::barrel_shift(Shift::Asr, value, 32, regs.cpsr.carry()),
            Shift::Ror => unreachable!(),
        }
    } else {
        arm::barrel_shift(shift, value, amount, regs.cpsr.carry())
    };
    regs.gpr[rd] = result;
    regs.cpsr.set_negative(result & 0x8000_0000 != 0);
    regs.cpsr.set_zero(result == 0);
    regs.cpsr.set_carry(carry);
}

fn exec_thumb_add_subtract(regs: &mut Registers, instr: u16) {
    let is_immediate = instr & (1 << 10) != 0;
    let is_sub = instr & (1 << 9) != 0;
    let operand = ((instr >> 6) & 0b111) as usize;
    let rs = ((instr >> 3) & 0b111) as usize;
    let rd = (instr & 0b111) as usize;
    let rs_value = regs.gpr[rs];
    let operand_value = if is_immediate { operand as u32 } else { regs.gpr[operand] };

    let (result, carry, overflow) = if is_sub {
        arm::add_with_carry(rs_value, !operand_value, 1)
    } else {
        arm::add_with_carry(rs_value, operand_value, 0)
    };
    regs.gpr[rd] = result;
    regs.cpsr.set_negative(result & 0x8000_0000 != 0);
    regs.cpsr.set_zero(result == 0);
    regs.cpsr.set_carry(carry);
    regs.cpsr.set_overflow(overflow);
}

fn exec_thumb_alu_immediate(regs: &mut Registers, instr: u16) {
    let op = (instr >> 11) & 0b11;
    let rd = ((instr >> 8) & 0b111) as usize;
    let imm = (instr & 0xFF) as u32;
    let rd_value = regs.gpr[rd];

    let dp_op = match op {
        0 => DpOpcode::Mov,
        1 => DpOpcode::Cmp,
        2 => DpOpcode::Add,
        _ => DpOpcode::Sub,
    };
    arm::exec_data_processing(regs, dp_op, rd, rd_value, imm, regs.cpsr.carry(), true);
}

fn exec_thumb_alu_register(regs: &mut Registers, instr: u16) {
    let op = (instr >> 6) & 0xF;
    let rs = ((instr >> 3) & 0b111) as usize;
    let rd = (instr & 0b111) as usize;
    let rd_value = regs.gpr[rd];
    let rs_value = regs.gpr[rs];

    match op {
        0x0 => arm::exec_data_processing(regs, DpOpcode::And, rd, rd_value, rs_value, regs.cpsr.carry(), true),
        0x1 => arm::exec_data_processing(regs, DpOpcode::Eor, rd, rd_value, rs_value, regs.cpsr.carry(), true),
        0x2 => {
            let (result, carry) = arm::barrel_shift(Shift::Lsl, rd_value, rs_value & 0xFF, regs.cpsr.carry());
            regs.gpr[rd] = result;
            regs.cpsr.set_negative(result & 0x8000_0000 != 0);
            regs.cpsr.set_zero(result == 0);
            if rs_value & 0xFF != 0 {
                regs.cpsr.set_carry(carry);
            }
        }
        0x3 => {
            let (result, carry) = arm::barrel_shift(Shift::Lsr, rd_value, rs_value & 0xFF, regs.cpsr.carry());
            regs.gpr[rd] = result;
            regs.cpsr.set_negative(result & 0x8000_0000 != 0);
            regs.cpsr.set_zero(result == 0);
            if rs_value & 0xFF != 0 {
                regs.cpsr.set_carry(carry);
            }
        }
        0x4 => {
            let (result, carry) = arm::barrel_shift(Shift::Asr, rd_value, rs_value & 0xFF, regs.cpsr.carry());
            regs.gpr[rd] = result;
            regs.cpsr.set_negative(result & 0x8000_0000 != 0);
            regs.cpsr.set_zero(result == 0);
            if rs_value & 0xFF != 0 {
                regs.cpsr.set_carry(carry);
            }
        }
        0x5 => arm::exec_data_processing(regs, DpOpcode::Adc, rd, rd_value, rs_value, regs.cpsr.carry(), true),
        0x6 => arm::exec_data_processing(regs, DpOpcode::Sbc, rd, rd_value, rs_value, regs.cpsr.carry(), true),
        0x7 => {
            let (result, carry) = arm::barrel_shift(Shift::Ror, rd_value, rs_value & 0xFF, regs.cpsr.carry());
            regs.gpr[rd] = result;
            regs.cpsr.set_negative(result & 0x8000_0000 != 0);
            regs.cpsr.set_zero(result == 0);
            if rs_value & 0xFF != 0 {
                regs.cpsr.set_carry(carry);
            }
        }
        0x8 => arm::exec_data_processing(regs, DpOpcode::Tst, rd, rd_value, rs_value, regs.cpsr.carry(), true),
        0x9 => {
            let (result, carry, overflow) = arm::add_with_carry(0, !rs_value, 1);
            regs.gpr[rd] = result;
            regs.cpsr.set_negative(result & 0x8000_0000 != 0);
            regs.cpsr.set_zero(result == 0);
            regs.cpsr.set_carry(carry);
            regs.cpsr.set_overflow(overflow);
        }
        0xA => arm::exec_data_processing(regs, DpOpcode::Cmp, rd, rd_value, rs_value, regs.cpsr.carry(), true),
        0xB => arm::exec_data_processing(regs, DpOpcode::Cmn, rd, rd_value, rs_value, regs.cpsr.carry(), true),
        0xC => arm::exec_data_processing(regs, DpOpcode::Orr, rd, rd_value, rs_value, regs.cpsr.carry(), true),
        0xD => arm::exec_multiply(regs, rd, rd, rs, None, true),
        0xE => arm::exec_data_processing(regs, DpOpcode::Bic, rd, rd_value, rs_value, regs.cpsr.carry(), true),
        _ => arm::exec_data_processing(regs, DpOpcode::Mvn, rd, rd_value, rs_value, regs.cpsr.carry(), true),
    }
}

/// Returns whether it branched (`gpr[15]` already points at the next
/// instruction to fetch, so the caller must not also advance it by 2).
fn exec_thumb_hi_register_ops(regs: &mut Registers, instr: u16) -> bool {
    let op = (instr >> 8) & 0b11;
    let h1 = instr & (1 << 7) != 0;
    let h2 = instr & (1 << 6) != 0;
    let rs = (((instr >> 3) & 0b111) | if h2 { 0b1000 } else { 0 }) as usize;
    let rd = ((instr & 0b111) | if h1 { 0b1000 } else { 0 }) as usize;

    let rs_value = if rs == 15 { regs.gpr[15].wrapping_add(2) } else { regs.gpr[rs] };
    match op {
        0b00 => {
            let result = regs.gpr[rd].wrapping_add(rs_value);
            regs.gpr[rd] = result;
            if rd == 15 {
                branch_to(regs, result, true);
                return true;
            }
            false
        }
        0b01 => {
            let rd_value = if rd == 15 { regs.gpr[15].wrapping_add(2) } else { regs.gpr[rd] };
            let (result, carry, overflow) = arm::add_with_carry(rd_value, !rs_value, 1);
            regs.cpsr.set_negative(result & 0x8000_0000 != 0);
            regs.cpsr.set_zero(result == 0);
            regs.cpsr.set_carry(carry);
            regs.cpsr.set_overflow(overflow);
            false
        }
        0b10 => {
            regs.gpr[rd] = rs_value;
            if rd == 15 {
                branch_to(regs, rs_value, true);
                return true;
            }
            false
        }
        _ => {
            branch_to(regs, rs_value, rs_value & 1 != 0);
            true
        }
    }
}

fn exec_thumb_pc_relative_load(regs: &mut Registers, bus: &mut impl Bus, instr: u16) {
    let rd = ((instr >> 8) & 0b111) as usize;
    let imm = (instr & 0xFF) as u32 * 4;
    let base = (pc_thumb(regs) & !3).wrapping_add(imm);
    regs.gpr[rd] = bus.read32(base);
}

fn exec_thumb_load_store_register_offset(regs: &mut Registers, bus: &mut impl Bus, instr: u16) {
    let is_load = instr & (1 << 11) != 0;
    let is_byte = instr & (1 << 10) != 0;
    let ro = ((instr >> 6) & 0b111) as usize;
    let rb = ((instr >> 3) & 0b111) as usize;
    let rd = (instr & 0b111) as usize;
    let addr = regs.gpr[rb].wrapping_add(regs.gpr[ro]);

    if is_load {
        regs.gpr[rd] = if is_byte { bus.read8(addr) as u32 } else { bus.read32(addr) };
    } else if is_byte {
        bus.write8(addr, regs.gpr[rd] as u8);
    } else {
        bus.write32(addr, regs.gpr[rd]);
    }
}

fn exec_thumb_load_store_sign_extended(regs: &mut Registers, bus: &mut impl Bus, instr: u16) {
    let op = (instr >> 10) & 0b11;
    let ro = ((instr >> 6) & 0b111) as usize;
    let rb = ((instr >> 3) & 0b111) as usize;
    let rd = (instr & 0b111) as usize;
    let addr = regs.gpr[rb].wrapping_add(regs.gpr[ro]);

    regs.gpr[rd] = match op {
        0b00 => bus.read16(addr) as u32, // STRH
        0b01 => (bus.read8(addr) as i8) as i32 as u32,  // LDSB
        0b10 => bus.read16(addr) as u32, // LDRH
        _ => (bus.read16(addr) as i16) as i32 as u32, // LDSH
    };
    if op == 0b00 {
        bus.write16(addr, regs.gpr[rd] as u16);
    }
}

fn exec_thumb_load_store_immediate_offset(regs: &mut Registers, bus: &mut impl Bus, instr: u16) {
    let is_byte = instr & (1 << 12) != 0;
    let is_load = instr & (1 << 11) != 0;
    let imm = ((instr >> 6) & 0x1F) as u32;
    let rb = ((instr >> 3) & 0b111) as usize;
    let rd = (instr & 0b111) as usize;
    let offset = if is_byte { imm } else { imm * 4 };
    let addr = regs.gpr[rb].wrapping_add(offset);

    if is_load {
        regs.gpr[rd] = if is_byte { bus.read8(addr) as u32 } else { bus.read32(addr) };
    } else if is_byte {
        bus.write8(addr, regs.gpr[rd] as u8);
    } else {
        bus.write32(addr, regs.gpr[rd]);
    }
}

fn exec_thumb_load_store_halfword(regs: &mut Registers, bus: &mut impl Bus, instr: u16) {
    let is_load = instr & (1 << 11) != 0;
    let imm = ((instr >> 6) & 0x1F) as u32 * 2;
    let rb = ((instr >> 3) & 0b111) as usize;
    let rd = (instr & 0b111) as usize;
    let addr = regs.gpr[rb].wrapping_add(imm);

    if is_load {
        regs.gpr[rd] = bus.read16(addr) as u32;
    } else {
        bus.write16(addr, regs.gpr[rd] as u16);
    }
}

fn exec_thumb_sp_relative_load_store(regs: &mut Registers, bus: &mut impl Bus, instr: u16) {
    let is_load = instr & (1 << 11) != 0;
    let rd = ((instr >> 8) & 0b111) as usize;
    let imm = (instr & 0xFF) as u32 * 4;
    let addr = regs.gpr[13].wrapping_add(imm);

    if is_load {
        regs.gpr[rd] = bus.read32(addr);
    } else {
        bus.write32(addr, regs.gpr[rd]);
    }
}

fn exec_thumb_load_address(regs: &mut Registers, instr: u16) {
    let use_sp = instr & (1 << 11) != 0;
    let rd = ((instr >> 8) & 0b111) as usize;
    let imm = (instr & 0xFF) as u32 * 4;
    let base = if use_sp { regs.gpr[13] } else { pc_thumb(regs) & !3 };
    regs.gpr[rd] = base.wrapping_add(imm);
}

fn exec_thumb_add_offset_to_sp(regs: &mut Registers, instr: u16) {
    let is_negative = instr & (1 << 7) != 0;
    let imm = ((instr & 0x7F) as u32) * 4;
    regs.gpr[13] = if is_negative { regs.gpr[13].wrapping_sub(imm) } else { regs.gpr[13].wrapping_add(imm) };
}

/// Returns whether it branched (`POP {..., pc}` loads `gpr[15]` directly).
fn exec_thumb_push_pop(regs: &mut Registers, bus: &mut impl Bus, instr: u16) -> bool {
    let is_load = instr & (1 << 11) != 0;
    let store_lr_load_pc = instr & (1 << 8) != 0;
    let reg_list = (instr & 0xFF) as u32;

    if is_load {
        let mut addr = regs.gpr[13];
        for reg in 0..8 {
            if reg_list & (1 << reg) != 0 {
                regs.gpr[reg] = bus.read32(addr);
                addr = addr.wrapping_add(4);
            }
        }
        let branched = if store_lr_load_pc {
            let value = bus.read32(addr);
            addr = addr.wrapping_add(4);
            branch_to(regs, value, true);
            true
        } else {
            false
        };
        regs.gpr[13] = addr;
        return branched;
    }
    {
        let count = reg_list.count_ones() + store_lr_load_pc as u32;
        let mut addr = regs.gpr[13].wrapping_sub(count * 4);
        regs.gpr[13] = addr;
        for reg in 0..8 {
            if reg_list & (1 << reg) != 0 {
                bus.write32(addr, regs.gpr[reg]);
                addr = addr.wrapping_add(4);
            }
        }
        if store_lr_load_pc {
            bus.write32(addr, regs.gpr[14]);
        }
    }
    false
}

fn exec_thumb_multiple_load_store(regs: &mut Registers, bus: &mut impl Bus, instr: u16) {
    let is_load = instr & (1 << 11) != 0;
    let rb = ((instr >> 8) & 0b111) as usize;
    let reg_list = (instr & 0xFF) as u32;
    let mut addr = regs.gpr[rb];

    for reg in 0..8 {
        if reg_list & (1 << reg) == 0 {
            continue;
        }
        if is_load {
            regs.gpr[reg] = bus.read32(addr);
        } else {
            bus.write32(addr, regs.gpr[reg]);
        }
        addr = addr.wrapping_add(4);
    }
    if !is_load || reg_list & (1 << rb) == 0 {
        regs.gpr[rb] = addr;
    }
}

/// Returns whether the branch was taken.
fn exec_thumb_conditional_branch(regs: &mut Registers, instr: u16) -> bool {
    let cond = ((instr >> 8) & 0xF) as u8;
    if !condition_passes(cond, regs.cpsr) {
        return false;
    }
    let offset = thumb::sign_extend_offset((instr & 0xFF) as u32, 8) << 1;
    branch_to(regs, pc_thumb(regs).wrapping_add(offset as u32), true);
    true
}

fn exec_thumb_unconditional_branch(regs: &mut Registers, instr: u16) {
    let offset = thumb::sign_extend_offset((instr & 0x7FF) as u32, 11) << 1;
    branch_to(regs, pc_thumb(regs).wrapping_add(offset as u32), true);
}

fn exec_thumb_long_branch_with_link(regs: &mut Registers, instr: u16) {
    let low = instr & (1 << 11) != 0;
    let offset11 = (instr & 0x7FF) as u32;
    if !low {
        let offset = thumb::sign_extend_offset(offset11, 11) << 12;
        regs.gpr[14] = pc_thumb(regs).wrapping_add(offset as u32);
        regs.gpr[15] = regs.gpr[15].wrapping_add(2);
    } else {
        let next_instr = regs.gpr[15].wrapping_add(2);
        let target = regs.gpr[14].wrapping_add(offset11 << 1);
        regs.gpr[14] = next_instr | 1;
        branch_to(regs, target, true);
    }
}

/// Dispatches to [`step_arm`] or [`step_thumb`] according to `CPSR.T`.
pub fn step(regs: &mut Registers, bus: &mut impl Bus, is_arm9: bool) -> StepEvent {
    if regs.cpsr.thumb_state() {
        step_thumb(regs, bus, is_arm9)
    } else {
        step_arm(regs, bus, is_arm9)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::psr::Psr;

    struct FlatBus(Vec<u8>);
    impl Bus for FlatBus {
        fn read8(&mut self, addr: u32) -> u8 {
            *self.0.get(addr as usize).unwrap_or(&0)
        }
        fn read16(&mut self, addr: u32) -> u16 {
            let lo = self.read8(addr) as u16;
            let hi = self.read8(addr.wrapping_add(1)) as u16;
            lo | (hi << 8)
        }
        fn read32(&mut self, addr: u32) -> u32 {
            let lo = self.read16(addr) as u32;
            let hi = self.read16(addr.wrapping_add(2)) as u32;
            lo | (hi << 16)
        }
        fn write8(&mut self, addr: u32, value: u8) {
            if (addr as usize) < self.0.len() {
                self.0[addr as usize] = value;
            }
        }
        fn write16(&mut self, addr: u32, value: u16) {
            self.write8(addr, value as u8);
            self.write8(addr.wrapping_add(1), (value >> 8) as u8);
        }
        fn write32(&mut self, addr: u32, value: u32) {
            self.write16(addr, value as u16);
            self.write16(addr.wrapping_add(2), (value >> 16) as u16);
        }
    }

    fn new_regs() -> Registers {
        let mut regs = Registers::new();
        regs.cpsr = Psr(0x10); // User mode, ARM state
        regs
    }

    #[test]
    fn arm_mov_immediate_sets_register() {
        let mut regs = new_regs();
        let mut bus = FlatBus(vec![0; 0x100]);
        // MOV R0, #5 (cond=AL, I=1, opcode=MOV, S=0)
        bus.write32(0, 0xE3A0_0005);
        let event = step_arm(&mut regs, &mut bus, false);
        assert_eq!(event, StepEvent::Normal);
        assert_eq!(regs.gpr[0], 5);
        assert_eq!(regs.gpr[15], 4);
    }

    #[test]
    fn arm_swi_is_reported_and_advances_pc() {
        let mut regs = new_regs();
        let mut bus = FlatBus(vec![0; 0x100]);
        bus.write32(0, 0xEF00_0006); // SWI #6
        let event = step_arm(&mut regs, &mut bus, false);
        assert_eq!(event, StepEvent::SoftwareInterrupt(6));
        assert_eq!(regs.gpr[15], 4);
    }

    #[test]
    fn arm_branch_sets_pc_and_flushes_pipeline() {
        let mut regs = new_regs();
        let mut bus = FlatBus(vec![0; 0x100]);
        bus.write32(0, 0xEA00_0000); // B #0 -> target = pc(8) + 0
        step_arm(&mut regs, &mut bus, false);
        assert_eq!(regs.gpr[15], 8);
    }

    #[test]
    fn thumb_mov_immediate_sets_register_and_flags() {
        let mut regs = new_regs();
        regs.cpsr.set_thumb_state(true);
        let mut bus = FlatBus(vec![0; 0x100]);
        bus.write16(0, 0x2000); // MOVS r0, #0
        let event = step_thumb(&mut regs, &mut bus, false);
        assert_eq!(event, StepEvent::Normal);
        assert_eq!(regs.gpr[0], 0);
        assert!(regs.cpsr.zero());
        assert_eq!(regs.gpr[15], 2);
    }

    #[test]
    fn thumb_unconditional_branch_updates_pc() {
        let mut regs = new_regs();
        regs.cpsr.set_thumb_state(true);
        let mut bus = FlatBus(vec![0; 0x100]);
        bus.write16(0, 0xE7FE); // B $-2 (branches to its own address)
        step_thumb(&mut regs, &mut bus, false);
        assert_eq!(regs.gpr[15], 0);
    }
}
