//! Integration tests for the native backend
//!
//! Tests the full pipeline: bytecode -> IR -> register allocation ->
//! machine code -> ELF serialization.

use opal_native::arm64::Arm64Codegen;
use opal_native::bytecode::{Chunk, Constant, Function, OpCode};
use opal_native::driver::{self, CompileOptions, EmitKind, TargetArch};
use opal_native::elf::{ExecutableBuilder, ObjectBuilder};
use opal_native::ir::Builder;
use opal_native::x64::X64Codegen;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn constant(chunk: &mut Chunk, value: Constant) {
    let idx = chunk.add_constant(value);
    chunk.write_op(OpCode::Constant, 1);
    chunk.write(idx as u8, 1);
}

/// `print 10 + 20; return nil`
fn add_and_print() -> Function {
    let mut func = Function::new("main", 0);
    constant(&mut func.chunk, Constant::Number(10.0));
    constant(&mut func.chunk, Constant::Number(20.0));
    func.chunk.write_op(OpCode::Add, 1);
    func.chunk.write_op(OpCode::Print, 1);
    func.chunk.write_op(OpCode::Nil, 2);
    func.chunk.write_op(OpCode::Return, 2);
    func
}

/// An infinite counting loop, exercising backward branches
fn counting_loop() -> Function {
    let mut func = Function::new("main", 0);
    func.chunk.write_op(OpCode::Nil, 1); // offset 0
    func.chunk.write_op(OpCode::Pop, 1); // offset 1
    func.chunk.write_op(OpCode::Loop, 1); // offset 2, back to 0
    func.chunk.write(0, 1);
    func.chunk.write(5, 1);
    func.chunk.write_op(OpCode::Nil, 2);
    func.chunk.write_op(OpCode::Return, 2);
    func
}

#[test]
fn test_x64_frame_setup_bytes() {
    init_logging();
    let func = add_and_print();
    let module = Builder::build(&func, "add.opal");
    let compiled = X64Codegen::new().compile(&module).unwrap();

    // Every function opens with push rbp; mov rbp, rsp
    assert_eq!(&compiled.code[0..4], &[0x55, 0x48, 0x89, 0xE5]);
    // And the buffer ends in ret
    assert_eq!(*compiled.code.last().unwrap(), 0xC3);
}

#[test]
fn test_x64_eight_argument_call() {
    init_logging();
    // An arity-8 helper invoked with eight constants
    let mut helper = Function::new("helper", 8);
    helper.chunk.write_op(OpCode::Nil, 1);
    helper.chunk.write_op(OpCode::Return, 1);

    let mut main = Function::new("main", 0);
    let idx = main.chunk.add_constant(Constant::Function(helper));
    main.chunk.write_op(OpCode::Closure, 1);
    main.chunk.write(idx as u8, 1);
    main.chunk.write(0, 1);
    for i in 1..=8 {
        constant(&mut main.chunk, Constant::Number(i as f64));
    }
    main.chunk.write_op(OpCode::Call, 1);
    main.chunk.write(8, 1);
    main.chunk.write_op(OpCode::Return, 1);

    let module = Builder::build(&main, "call8.opal");
    let compiled = X64Codegen::new().compile(&module).unwrap();
    let code = &compiled.code;

    // The argument values are vregs: the first one is register-allocated
    // and moved into RDI (mov rdi, rbx)
    let mov_rdi_rbx = [0x48, 0x89, 0xDF];
    assert!(code.windows(3).any(|w| w == mov_rdi_rbx));
    // Arguments 7 and 8 overflow the five-register pool and spill;
    // the pushes run right-to-left, so the deeper slot (argument 8 at
    // rbp-72) reloads before argument 7 at rbp-64, each followed by a
    // push rax
    let reload_8 = [0x48, 0x8B, 0x85, 0xB8, 0xFF, 0xFF, 0xFF];
    let reload_7 = [0x48, 0x8B, 0x85, 0xC0, 0xFF, 0xFF, 0xFF];
    let pos8 = code.windows(7).position(|w| w == reload_8).unwrap();
    let pos7 = code.windows(7).position(|w| w == reload_7).unwrap();
    assert!(pos8 < pos7);
    assert_eq!(code[pos8 + 7], 0x50);
    assert_eq!(code[pos7 + 7], 0x50);
    // Stack arguments are reclaimed after the call: add rsp, 16
    let add_rsp_16 = [0x48, 0x81, 0xC4, 0x10, 0x00, 0x00, 0x00];
    assert!(code.windows(7).any(|w| w == add_rsp_16));
}

#[test]
fn test_arm64_backward_branch_patch() {
    init_logging();
    let func = counting_loop();
    let module = Builder::build(&func, "loop.opal");
    let compiled = Arm64Codegen::new().compile(&module).unwrap();

    assert_eq!(compiled.code.len() % 4, 0);
    // Find the unconditional B and check the opcode bits survived patching
    let b_word = compiled
        .code
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .find(|w| w & 0xFC000000 == 0x14000000)
        .expect("b emitted");
    // The displacement is backward, so imm26 is sign-extended negative
    let imm26 = b_word & 0x03FFFFFF;
    assert!(imm26 & 0x02000000 != 0);
}

#[test]
fn test_object_file_identification() {
    init_logging();
    let func = add_and_print();
    let module = Builder::build(&func, "add.opal");
    let compiled = X64Codegen::new().compile(&module).unwrap();
    let obj = ObjectBuilder::new(&compiled).build().unwrap();

    assert_eq!(&obj[0..4], &[0x7F, b'E', b'L', b'F']);
    assert_eq!(u16::from_le_bytes([obj[16], obj[17]]), 1); // ET_REL
    assert_eq!(u16::from_le_bytes([obj[18], obj[19]]), 62); // EM_X86_64
}

#[test]
fn test_relocations_stay_in_bounds() {
    init_logging();
    let func = add_and_print();
    for arch in [TargetArch::X86_64, TargetArch::Arm64] {
        let opts = CompileOptions::new(arch, "unused.o");
        let compiled = driver::compile_to_module(&func, "add.opal", &opts).unwrap();
        assert!(!compiled.relocations.is_empty());
        for reloc in &compiled.relocations {
            assert!(reloc.offset + 4 <= compiled.code.len());
        }
        // One symbol per IR function, the entry first
        assert_eq!(compiled.symbols.len(), 1);
        assert_eq!(compiled.symbols[0].name, "main");
    }
}

#[test]
fn test_executable_requires_resolved_code() {
    init_logging();
    // Print needs the runtime, so a standalone executable must refuse
    let func = add_and_print();
    let module = Builder::build(&func, "add.opal");
    let compiled = X64Codegen::new().compile(&module).unwrap();
    assert!(ExecutableBuilder::new(&compiled).build().is_err());
}

#[test]
fn test_executable_for_pure_code() {
    init_logging();
    // `return 7` needs no runtime helpers on either target
    let mut func = Function::new("main", 0);
    constant(&mut func.chunk, Constant::Number(7.0));
    func.chunk.write_op(OpCode::Return, 1);

    for arch in [TargetArch::X86_64, TargetArch::Arm64] {
        let opts = CompileOptions::new(arch, "unused");
        let compiled = driver::compile_to_module(&func, "seven.opal", &opts).unwrap();
        let exe = ExecutableBuilder::new(&compiled).build().unwrap();
        assert_eq!(&exe[0..4], &[0x7F, b'E', b'L', b'F']);
        assert_eq!(u16::from_le_bytes([exe[16], exe[17]]), 2); // ET_EXEC
        // Two loadable segments
        assert_eq!(u16::from_le_bytes([exe[56], exe[57]]), 2);
        // Entry sits inside the first segment
        let entry = u64::from_le_bytes(exe[24..32].try_into().unwrap());
        assert!(entry >= 0x400000 && entry < 0x400000 + exe.len() as u64);
    }
}

#[test]
fn test_driver_writes_object_file() {
    init_logging();
    let func = add_and_print();
    let path = std::env::temp_dir().join("opal_backend_test.o");
    let opts = CompileOptions::new(TargetArch::X86_64, &path);
    driver::compile(&func, "add.opal", &opts).unwrap();

    let obj = std::fs::read(&path).unwrap();
    assert_eq!(&obj[0..4], &[0x7F, b'E', b'L', b'F']);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_branchy_program_compiles_on_both_targets() {
    init_logging();
    // if-style shape: condition, conditional skip, two arms, join
    let mut func = Function::new("main", 0);
    func.chunk.write_op(OpCode::True, 1); // 0
    func.chunk.write_op(OpCode::JumpIfFalse, 1); // 1, to the else arm at 10
    func.chunk.write(0, 1);
    func.chunk.write(6, 1);
    func.chunk.write_op(OpCode::Pop, 1); // 4
    constant(&mut func.chunk, Constant::Number(1.0)); // 5..=6
    func.chunk.write_op(OpCode::Jump, 1); // 7
    func.chunk.write(0, 1);
    func.chunk.write(3, 1);
    func.chunk.write_op(OpCode::Pop, 2); // 10
    constant(&mut func.chunk, Constant::Number(2.0)); // 11..=12
    func.chunk.write_op(OpCode::Return, 3); // 13

    for arch in [TargetArch::X86_64, TargetArch::Arm64] {
        let opts = CompileOptions::new(arch, "unused");
        let compiled = driver::compile_to_module(&func, "branch.opal", &opts).unwrap();
        assert!(!compiled.code.is_empty());
    }
}
