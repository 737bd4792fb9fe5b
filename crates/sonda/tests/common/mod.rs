//! Shared test fixtures: a tiny stack interpreter for the abstract opcode
//! set and a code unit modeled on the classic `isPrime` coverage walkthrough.

#![allow(dead_code)]

use sonda::{Cmp, CodeUnit, LabelId, Method, Node, Opcode, ProbeArray};
use std::collections::HashMap;

/// Execute one method of a unit with integer arguments
///
/// Supports the full branching subset of the opcode set plus probe
/// instructions, which are recorded into `probes`. Field access and
/// invocation are not needed by these fixtures.
pub fn run(unit: &CodeUnit, method_name: &str, args: &[i64], probes: &ProbeArray) -> Option<i64> {
    let method = unit
        .methods
        .iter()
        .find(|m| m.name == method_name)
        .expect("method exists");

    let mut labels: HashMap<LabelId, usize> = HashMap::new();
    for (i, node) in method.body.iter().enumerate() {
        if let Node::Label(label) = node {
            labels.insert(*label, i);
        }
    }

    let mut locals = vec![0i64; method.max_locals as usize];
    locals[..args.len()].copy_from_slice(args);
    let mut stack: Vec<i64> = Vec::new();
    let mut pc = 0usize;

    loop {
        let node = method.body.get(pc).expect("control stays inside the body");
        let op = match node {
            Node::Insn(op) => op,
            _ => {
                pc += 1;
                continue;
            }
        };
        match op {
            Opcode::Const(value) => stack.push(*value),
            Opcode::LoadSelf => stack.push(locals[0]),
            Opcode::LoadLocal(slot) => stack.push(locals[*slot as usize]),
            Opcode::StoreLocal(slot) => {
                let value = stack.pop().expect("operand");
                locals[*slot as usize] = value;
            }
            Opcode::Add | Opcode::Mul | Opcode::Xor => {
                let b = stack.pop().expect("operand");
                let a = stack.pop().expect("operand");
                stack.push(match op {
                    Opcode::Add => a.wrapping_add(b),
                    Opcode::Mul => a.wrapping_mul(b),
                    _ => a ^ b,
                });
            }
            Opcode::Branch { cmp, target } => {
                let b = stack.pop().expect("operand");
                let a = stack.pop().expect("operand");
                let taken = match cmp {
                    Cmp::Eq => a == b,
                    Cmp::Ne => a != b,
                    Cmp::Lt => a < b,
                    Cmp::Le => a <= b,
                    Cmp::Gt => a > b,
                    Cmp::Ge => a >= b,
                };
                if taken {
                    pc = labels[target];
                    continue;
                }
            }
            Opcode::Goto(target) => {
                pc = labels[target];
                continue;
            }
            Opcode::TableSwitch { low, targets, default } => {
                let value = stack.pop().expect("operand");
                let index = value.wrapping_sub(*low);
                let label = usize::try_from(index)
                    .ok()
                    .and_then(|i| targets.get(i))
                    .unwrap_or(default);
                pc = labels[label];
                continue;
            }
            Opcode::LookupSwitch { keys, targets, default } => {
                let value = stack.pop().expect("operand");
                let label = keys
                    .iter()
                    .position(|k| *k == value)
                    .map_or(default, |i| &targets[i]);
                pc = labels[label];
                continue;
            }
            Opcode::Return => return None,
            Opcode::ReturnValue => return Some(stack.pop().expect("operand")),
            Opcode::Probe(probe) => probes.hit(*probe),
            Opcode::GetField(_) | Opcode::PutField(_) | Opcode::Invoke(_) => {
                panic!("fixture interpreter does not model member access")
            }
        }
        pc += 1;
    }
}

/// The `isPrime` walkthrough target
///
/// ```text
/// line 2:  for (i = 2; i * i <= n; i++)
///              if ((n ^ i) == 0) return false;
/// line 3:  return true;
/// ```
///
/// Slot 0 holds `n`, slot 1 holds `i`. Two branch points: the loop
/// condition and the divisor check.
pub fn is_prime_unit() -> CodeUnit {
    let loop_head = LabelId::new(0);
    let next_i = LabelId::new(1);
    let done = LabelId::new(2);
    CodeUnit::new("demo/PrimeTarget", 1).with_method(
        Method::new("is_prime", "(I)Z", 2).with_body(vec![
            Node::Line(2),
            Node::Insn(Opcode::Const(2)),
            Node::Insn(Opcode::StoreLocal(1)),
            Node::Label(loop_head),
            Node::Insn(Opcode::LoadLocal(1)),
            Node::Insn(Opcode::LoadLocal(1)),
            Node::Insn(Opcode::Mul),
            Node::Insn(Opcode::LoadLocal(0)),
            Node::Insn(Opcode::Branch { cmp: Cmp::Gt, target: done }),
            Node::Insn(Opcode::LoadLocal(0)),
            Node::Insn(Opcode::LoadLocal(1)),
            Node::Insn(Opcode::Xor),
            Node::Insn(Opcode::Const(0)),
            Node::Insn(Opcode::Branch { cmp: Cmp::Ne, target: next_i }),
            Node::Insn(Opcode::Const(0)),
            Node::Insn(Opcode::ReturnValue),
            Node::Label(next_i),
            Node::Insn(Opcode::LoadLocal(1)),
            Node::Insn(Opcode::Const(1)),
            Node::Insn(Opcode::Add),
            Node::Insn(Opcode::StoreLocal(1)),
            Node::Insn(Opcode::Goto(loop_head)),
            Node::Label(done),
            Node::Line(3),
            Node::Insn(Opcode::Const(1)),
            Node::Insn(Opcode::ReturnValue),
        ]),
    )
}

/// Reference semantics of the fixture, for behavior-preservation checks
pub fn is_prime_reference(n: i64) -> i64 {
    let mut i = 2i64;
    while i.wrapping_mul(i) <= n {
        if n ^ i == 0 {
            return 0;
        }
        i = i.wrapping_add(1);
    }
    1
}
