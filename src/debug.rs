// File: src/debug.rs
//
// Chunk disassembler, used by the print_code and trace_execution features.

use crate::chunk::{Chunk, OpCode};
use crate::memory::Heap;
use crate::value::Value;

pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) {
    println!("== {} ==", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset);
    }
}

/// Print one instruction and return the offset of the next.
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> usize {
    print!("{:04} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        print!("   | ");
    } else {
        print!("{:4} ", chunk.lines[offset]);
    }

    let byte = chunk.code[offset];
    let op = match OpCode::try_from(byte) {
        Ok(op) => op,
        Err(bad) => {
            println!("Unknown opcode {}", bad);
            return offset + 1;
        }
    };

    match op {
        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => constant_instruction(op, heap, chunk, offset),
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => byte_instruction(op, chunk, offset),
        OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(op, 1, chunk, offset),
        OpCode::Loop => jump_instruction(op, -1, chunk, offset),
        OpCode::Invoke | OpCode::SuperInvoke => invoke_instruction(op, heap, chunk, offset),
        OpCode::Closure => closure_instruction(heap, chunk, offset),
        _ => {
            println!("{:?}", op);
            offset + 1
        }
    }
}

fn constant_instruction(op: OpCode, heap: &Heap, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.code[offset + 1] as usize;
    let rendered = heap.format_value(chunk.constants[constant]);
    println!("{:<16} {:4} '{}'", format!("{:?}", op), constant, rendered);
    offset + 2
}

fn byte_instruction(op: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.code[offset + 1];
    println!("{:<16} {:4}", format!("{:?}", op), slot);
    offset + 2
}

fn jump_instruction(op: OpCode, sign: i64, chunk: &Chunk, offset: usize) -> usize {
    let jump = ((chunk.code[offset + 1] as u16) << 8 | chunk.code[offset + 2] as u16) as i64;
    let target = offset as i64 + 3 + sign * jump;
    println!("{:<16} {:4} -> {}", format!("{:?}", op), offset, target);
    offset + 3
}

fn invoke_instruction(op: OpCode, heap: &Heap, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.code[offset + 1] as usize;
    let arg_count = chunk.code[offset + 2];
    let rendered = heap.format_value(chunk.constants[constant]);
    println!("{:<16} ({} args) {:4} '{}'", format!("{:?}", op), arg_count, constant, rendered);
    offset + 3
}

/// CLOSURE carries a variable-length operand: the function constant plus one
/// (is_local, index) pair per upvalue.
fn closure_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> usize {
    let mut offset = offset + 1;
    let constant = chunk.code[offset] as usize;
    offset += 1;
    println!("{:<16} {:4} {}", "Closure", constant, heap.format_value(chunk.constants[constant]));

    let upvalue_count = match chunk.constants[constant] {
        Value::Obj(function) => heap.function(function).upvalue_count,
        _ => 0,
    };
    for _ in 0..upvalue_count {
        let is_local = chunk.code[offset];
        let index = chunk.code[offset + 1];
        println!(
            "{:04}      |                     {} {}",
            offset,
            if is_local == 1 { "local" } else { "upvalue" },
            index
        );
        offset += 2;
    }
    offset
}
