//! Tests for GeneralRegisters structure.

use crate::exit::AccessWidth;
use crate::regs::{GeneralRegisters, GeneralRegistersDiff};

#[test]
fn test_general_registers_default() {
    let regs = GeneralRegisters::default();
    for index in (0..16).filter(|&i| i != 4) {
        assert_eq!(regs.get_reg_of_index(index), 0);
    }
}

#[test]
fn test_general_registers_eq() {
    let regs1 = GeneralRegisters::default();
    let regs2 = GeneralRegisters::default();
    assert_eq!(regs1, regs2);

    let mut regs3 = GeneralRegisters::default();
    regs3.rax = 1;
    assert_ne!(regs1, regs3);
}

#[test]
fn test_register_name_function() {
    assert_eq!(GeneralRegisters::register_name(0), "rax");
    assert_eq!(GeneralRegisters::register_name(4), "rsp");
    assert_eq!(GeneralRegisters::register_name(8), "r8");
    assert_eq!(GeneralRegisters::register_name(15), "r15");
}

#[test]
fn test_get_reg_of_index() {
    let mut regs = GeneralRegisters::default();
    regs.rax = 0x100;
    regs.rcx = 0x101;
    regs.rdx = 0x102;
    regs.rbx = 0x103;
    regs.rbp = 0x105;
    regs.rsi = 0x106;
    regs.rdi = 0x107;
    regs.r8 = 0x108;
    regs.r15 = 0x10f;

    assert_eq!(regs.get_reg_of_index(0), 0x100);
    assert_eq!(regs.get_reg_of_index(1), 0x101);
    assert_eq!(regs.get_reg_of_index(2), 0x102);
    assert_eq!(regs.get_reg_of_index(3), 0x103);
    assert_eq!(regs.get_reg_of_index(5), 0x105);
    assert_eq!(regs.get_reg_of_index(6), 0x106);
    assert_eq!(regs.get_reg_of_index(7), 0x107);
    assert_eq!(regs.get_reg_of_index(8), 0x108);
    assert_eq!(regs.get_reg_of_index(15), 0x10f);
}

#[test]
fn test_set_reg_of_index() {
    let mut regs = GeneralRegisters::default();

    regs.set_reg_of_index(0, 0x1000);
    assert_eq!(regs.rax, 0x1000);

    regs.set_reg_of_index(8, 0x8000);
    assert_eq!(regs.r8, 0x8000);

    regs.set_reg_of_index(15, 0xf000);
    assert_eq!(regs.r15, 0xf000);
}

#[test]
fn test_rsp_slot_is_inert() {
    // RSP lives in the execution context: the slot reads zero, writes vanish.
    let mut regs = GeneralRegisters::default();
    regs.set_reg_of_index(4, 0xdead);
    assert_eq!(regs.get_reg_of_index(4), 0);
    assert_eq!(regs, GeneralRegisters::default());
}

#[test]
fn test_edx_eax() {
    let mut regs = GeneralRegisters::default();
    regs.rax = 0xffff_ffff_1234_5678;
    regs.rdx = 0xffff_ffff_abcd_ef00;
    assert_eq!(regs.get_edx_eax(), 0xabcd_ef00_1234_5678);

    regs.set_edx_eax(0x1122_3344_5566_7788);
    assert_eq!(regs.rax, 0x5566_7788);
    assert_eq!(regs.rdx, 0x1122_3344);
}

#[test]
fn test_io_result_widths() {
    let mut regs = GeneralRegisters::default();

    // IN AL/AX keep the rest of RAX.
    regs.rax = 0xfedc_ba98_7654_3210;
    regs.set_io_result(AccessWidth::Byte, 0x1ef);
    assert_eq!(regs.rax, 0xfedc_ba98_7654_32ef);

    regs.set_io_result(AccessWidth::Word, 0xabcd);
    assert_eq!(regs.rax, 0xfedc_ba98_7654_abcd);

    // IN EAX zero-extends.
    regs.set_io_result(AccessWidth::Dword, 0x1234_5678);
    assert_eq!(regs.rax, 0x1234_5678);
}

#[test]
fn test_io_operand() {
    let mut regs = GeneralRegisters::default();
    regs.rax = 0xfedc_ba98_7654_3210;
    assert_eq!(regs.io_operand(AccessWidth::Byte), 0x10);
    assert_eq!(regs.io_operand(AccessWidth::Word), 0x3210);
    assert_eq!(regs.io_operand(AccessWidth::Dword), 0x7654_3210);
}

#[test]
fn test_debug_format() {
    let mut regs = GeneralRegisters::default();
    regs.rax = 0x1234;
    let debug_str = alloc::format!("{:?}", regs);
    assert!(debug_str.contains("GeneralRegisters"));
}

#[test]
fn test_registers_diff() {
    let before = GeneralRegisters::default();
    assert!(GeneralRegistersDiff::new(before, before).is_same());

    let mut after = before;
    after.rax = 0x1;
    after.r9 = 0x2;
    let diff = GeneralRegistersDiff::new(before, after);
    assert!(!diff.is_same());
    assert_eq!(diff.changed(), 2);
    let debug_str = alloc::format!("{:?}", diff);
    assert!(debug_str.contains("rax"));
    assert!(debug_str.contains("r9"));
    assert!(!debug_str.contains("rbx"));
}

#[test]
#[should_panic(expected = "Illegal index")]
fn test_get_reg_invalid_index_high() {
    let regs = GeneralRegisters::default();
    let _ = regs.get_reg_of_index(16);
}

#[test]
#[should_panic(expected = "Illegal index")]
fn test_set_reg_invalid_index_high() {
    let mut regs = GeneralRegisters::default();
    regs.set_reg_of_index(16, 0);
}
