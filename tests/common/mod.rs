//! Shared programs and helpers for integration tests
#![allow(dead_code)]

use quicksilver_jit::bytecode::{Assembler, FunctionBody, Program};
use quicksilver_jit::{Engine, FunctionId, JitConfig};

pub fn program(functions: Vec<FunctionBody>) -> Program {
    Program { functions, entry: 0 }
}

/// Engine with `program` loaded; returns the entry function
pub fn load(config: JitConfig, program: &Program) -> (Engine, FunctionId) {
    let mut engine = Engine::new(config).expect("engine");
    let entry = engine.load_program(program).expect("load");
    (engine, entry)
}

/// `f(x)`: adds zero to `x` repeatedly; `non_loads` counts the return
pub fn padded_identity(non_loads: usize) -> FunctionBody {
    let mut asm = Assembler::new("padded", 1);
    asm.load_arg(0, 0).load_int(1, 0);
    asm.add(2, 0, 1);
    for _ in 2..non_loads {
        asm.add(2, 2, 1);
    }
    asm.ret(2);
    asm.finish().expect("padded")
}

/// `addOne(x) = x + 1`
pub fn add_one() -> FunctionBody {
    let mut asm = Assembler::new("addOne", 1);
    asm.load_arg(0, 0).load_int(1, 1).add(2, 0, 1).ret(2);
    asm.finish().expect("addOne")
}

/// `sum(n)`: 0 + 1 + ... + (n - 1) with one loop
pub fn sum_loop() -> FunctionBody {
    let mut asm = Assembler::new("sum", 1);
    let head = asm.new_label();
    let exit = asm.new_label();
    // r0 = n, r1 = i, r2 = 1, r4 = acc
    asm.load_arg(0, 0).load_int(1, 0).load_int(2, 1).load_int(4, 0);
    asm.bind(head);
    asm.loop_header();
    asm.lt(3, 1, 0).jump_if_false(3, exit).add(4, 4, 1).add(1, 1, 2).jump(head);
    asm.bind(exit);
    asm.ret(4);
    asm.finish().expect("sum")
}

/// `[caller, m, g]`: `caller(o, x) = o.m(x)`, `m(x) = x + 1`, `g(x) = x * 2`
pub fn method_program() -> Program {
    let mut asm = Assembler::new("caller", 2);
    asm.load_arg(0, 0).load_arg(1, 1).call_method(2, 0, "m", 1, 1).ret(2);
    let caller = asm.finish().expect("caller");

    let mut asm = Assembler::new("m", 1);
    asm.load_arg(0, 0).load_int(1, 1).add(2, 0, 1).ret(2);
    let m = asm.finish().expect("m");

    let mut asm = Assembler::new("g", 1);
    asm.load_arg(0, 0).load_int(1, 2).mul(2, 0, 1).ret(2);
    let g = asm.finish().expect("g");

    program(vec![caller, m, g])
}

/// `[make, Point]`: `make(a) = { p = new Point(a, a + 1); p.x + p.y }`,
/// `Point(x, y) { this.x = x; this.y = y }`
pub fn point_program() -> Program {
    let mut asm = Assembler::new("make", 1);
    asm.load_func(0, 1)
        .load_arg(1, 0)
        .load_int(3, 1)
        .add(2, 1, 3)
        .construct(4, 0, 1, 2)
        .get_field(5, 4, "x")
        .get_field(6, 4, "y")
        .add(7, 5, 6)
        .ret(7);
    let make = asm.finish().expect("make");

    let mut asm = Assembler::new("Point", 2);
    asm.load_this(0)
        .load_arg(1, 0)
        .load_arg(2, 1)
        .set_field(0, "x", 1)
        .set_field(0, "y", 2)
        .load_undefined(3)
        .ret(3);
    let point = asm.finish().expect("Point");

    program(vec![make, point])
}

/// Tiering thresholds small enough for quick tests
pub fn quick_config() -> JitConfig {
    let mut config = JitConfig::synchronous();
    config.tiers.simple_jit_call_threshold = 4;
    config.tiers.full_jit_call_threshold = 16;
    config
}
