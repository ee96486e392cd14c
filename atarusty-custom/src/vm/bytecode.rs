/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Compiled script functions and the classes of objects scripts can call methods on.
use core::fmt;

bitflags::bitflags! {
    /// Properties of external methods and compiled functions.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MethodFlags: u8 {
        /// May suspend the calling thread inside an SIO command script.
        const ASYNC_SIO     = 0b0001;
        /// May suspend the calling thread in event handlers and script threads.
        const ASYNC_RAW_SIO = 0b0010;
        /// May suspend the calling thread anywhere suspension is allowed.
        const ASYNC_ALL     = Self::ASYNC_SIO.bits() | Self::ASYNC_RAW_SIO.bits();
        /// Reaches outside of the emulated machine, requires the unsafe device setting.
        const UNSAFE        = 0b0100;
    }
}

/// Built-in object classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClassId {
    Thread,
    Segment,
    MemoryLayer,
    Network,
    Sio,
    SioDevice,
    PbiDevice,
    Clock,
    Console,
    ControllerPort,
    Debug,
    Image,
    VideoOutput,
    Sound,
    SoundParams,
    Emulator,
}

/// The type of a method argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgType {
    Int,
    /// A string literal.
    Str,
    /// A reference to a function taking no arguments.
    Func,
    Object(ClassId),
}

/// An external method.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MethodDesc {
    pub name: &'static str,
    pub args: &'static [ArgType],
    pub returns_int: bool,
    pub flags: MethodFlags,
}

const fn method(name: &'static str, args: &'static [ArgType]) -> MethodDesc {
    MethodDesc { name, args, returns_int: false, flags: MethodFlags::empty() }
}

const fn int_method(name: &'static str, args: &'static [ArgType]) -> MethodDesc {
    MethodDesc { name, args, returns_int: true, flags: MethodFlags::empty() }
}

const fn async_method(name: &'static str, args: &'static [ArgType], returns_int: bool, flags: MethodFlags) -> MethodDesc {
    MethodDesc { name, args, returns_int, flags }
}

use ArgType::{Int, Str, Func};
const SEGMENT: ArgType = ArgType::Object(ClassId::Segment);
const IMAGE: ArgType = ArgType::Object(ClassId::Image);
const SOUND_PARAMS: ArgType = ArgType::Object(ClassId::SoundParams);

const THREAD_METHODS: &[MethodDesc] = &[
    int_method("is_running", &[]),
    method("run", &[Func]),
    method("interrupt", &[]),
    async_method("sleep", &[Int], false, MethodFlags::ASYNC_ALL),
    async_method("join", &[], false, MethodFlags::ASYNC_ALL),
];

const SEGMENT_METHODS: &[MethodDesc] = &[
    int_method("get_length", &[]),
    method("clear", &[Int]),
    method("fill", &[Int, Int, Int]),
    method("xor_const", &[Int, Int, Int]),
    method("reverse_bits", &[Int, Int]),
    method("translate", &[Int, SEGMENT, Int, Int, SEGMENT, Int]),
    method("copy", &[Int, SEGMENT, Int, Int]),
    method("copy_rect", &[Int, Int, SEGMENT, Int, Int, Int, Int]),
    int_method("read_byte", &[Int]),
    method("write_byte", &[Int, Int]),
    int_method("read_word", &[Int]),
    method("write_word", &[Int, Int]),
    int_method("read_rev_word", &[Int]),
    method("write_rev_word", &[Int, Int]),
];

const MEMORY_LAYER_METHODS: &[MethodDesc] = &[
    method("set_offset", &[Int]),
    method("set_segment_and_offset", &[SEGMENT, Int]),
    method("set_modes", &[Int, Int]),
    method("set_readonly", &[Int]),
    method("set_base_address", &[Int]),
];

const NETWORK_METHODS: &[MethodDesc] = &[
    int_method("send_message", &[Int, Int]),
    int_method("post_message", &[Int, Int]),
];

const SIO_METHODS: &[MethodDesc] = &[
    method("ack", &[]),
    method("nak", &[]),
    method("error", &[]),
    method("complete", &[]),
    async_method("send_frame", &[SEGMENT, Int, Int], false, MethodFlags::ASYNC_SIO),
    async_method("recv_frame", &[Int], false, MethodFlags::ASYNC_SIO),
    async_method("delay", &[Int], false, MethodFlags::ASYNC_SIO),
    method("enable_raw", &[Int]),
    method("set_proceed", &[Int]),
    method("set_interrupt", &[Int]),
    int_method("command_asserted", &[]),
    int_method("motor_asserted", &[]),
    async_method("send_raw_byte", &[Int, Int], false, MethodFlags::ASYNC_RAW_SIO),
    async_method("recv_raw_byte", &[], true, MethodFlags::ASYNC_RAW_SIO),
    async_method("wait_command", &[], true, MethodFlags::ASYNC_RAW_SIO),
    async_method("wait_command_off", &[], true, MethodFlags::ASYNC_RAW_SIO),
    async_method("wait_motor_changed", &[], true, MethodFlags::ASYNC_RAW_SIO),
    method("reset_recv_checksum", &[]),
    method("reset_send_checksum", &[]),
    int_method("get_recv_checksum", &[]),
    int_method("check_recv_checksum", &[]),
    int_method("get_send_checksum", &[]),
];

const PBI_DEVICE_METHODS: &[MethodDesc] = &[
    method("assert_irq", &[]),
    method("negate_irq", &[]),
];

const CLOCK_METHODS: &[MethodDesc] = &[
    method("capture_local_time", &[]),
    int_method("local_year", &[]),
    int_method("local_month", &[]),
    int_method("local_day", &[]),
    int_method("local_day_of_week", &[]),
    int_method("local_hour", &[]),
    int_method("local_minute", &[]),
    int_method("local_second", &[]),
];

const CONSOLE_METHODS: &[MethodDesc] = &[
    method("set_console_button_state", &[Int, Int]),
    method("set_key_state", &[Int, Int]),
    method("push_break", &[]),
];

const CONTROLLER_PORT_METHODS: &[MethodDesc] = &[
    method("set_paddle_a", &[Int]),
    method("set_paddle_b", &[Int]),
    method("set_trigger", &[Int]),
    method("set_dirs", &[Int]),
];

const DEBUG_METHODS: &[MethodDesc] = &[
    method("log", &[Str]),
    method("log_int", &[Str, Int]),
];

const IMAGE_METHODS: &[MethodDesc] = &[
    method("clear", &[Int]),
    int_method("get_pixel", &[Int, Int]),
    method("put_pixel", &[Int, Int, Int]),
    method("fill_rect", &[Int, Int, Int, Int, Int]),
    method("invert_rect", &[Int, Int, Int, Int]),
    method("blt", &[Int, Int, IMAGE, Int, Int, Int, Int]),
    method("blt_expand1", &[Int, Int, SEGMENT, Int, Int, Int, Int, Int, Int]),
    method("blt_tile_map", &[Int, Int, IMAGE, Int, Int, SEGMENT, Int, Int, Int, Int]),
];

const VIDEO_OUTPUT_METHODS: &[MethodDesc] = &[
    method("set_par", &[Int, Int]),
    method("set_image", &[IMAGE]),
    method("mark_active", &[]),
    method("set_pass_through", &[Int]),
    method("set_text_area", &[Int, Int]),
    method("set_copy_text_source", &[SEGMENT, Int, Int]),
];

const SOUND_METHODS: &[MethodDesc] = &[
    method("play", &[SOUND_PARAMS]),
    method("stop_all", &[]),
];

const SOUND_PARAMS_METHODS: &[MethodDesc] = &[
    method("set_pan", &[Int, Int]),
    method("set_volume", &[Int, Int]),
    method("set_rate", &[Int, Int]),
    method("set_looping", &[Int]),
];

const EMULATOR_METHODS: &[MethodDesc] = &[
    async_method("run_command", &[Str], false, MethodFlags::from_bits_truncate(
        MethodFlags::ASYNC_ALL.bits() | MethodFlags::UNSAFE.bits())),
];

impl ClassId {
    /// Classes that may be declared by configurations.
    pub const DECLARABLE: &'static [ClassId] = &[
        ClassId::Thread, ClassId::Segment, ClassId::MemoryLayer, ClassId::SioDevice,
        ClassId::PbiDevice, ClassId::Console, ClassId::ControllerPort, ClassId::Image,
        ClassId::VideoOutput, ClassId::Sound, ClassId::SoundParams,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ClassId::Thread => "Thread",
            ClassId::Segment => "Segment",
            ClassId::MemoryLayer => "MemoryLayer",
            ClassId::Network => "Network",
            ClassId::Sio => "SIO",
            ClassId::SioDevice => "SIODevice",
            ClassId::PbiDevice => "PBIDevice",
            ClassId::Clock => "Clock",
            ClassId::Console => "Console",
            ClassId::ControllerPort => "ControllerPort",
            ClassId::Debug => "Debug",
            ClassId::Image => "Image",
            ClassId::VideoOutput => "VideoOutput",
            ClassId::Sound => "Sound",
            ClassId::SoundParams => "SoundParams",
            ClassId::Emulator => "Emulator",
        }
    }
    /// Looks up a declarable class by name.
    pub fn from_name(name: &str) -> Option<ClassId> {
        ClassId::DECLARABLE.iter().copied().find(|c| c.name() == name)
    }

    pub fn methods(self) -> &'static [MethodDesc] {
        match self {
            ClassId::Thread => THREAD_METHODS,
            ClassId::Segment => SEGMENT_METHODS,
            ClassId::MemoryLayer => MEMORY_LAYER_METHODS,
            ClassId::Network => NETWORK_METHODS,
            ClassId::Sio => SIO_METHODS,
            ClassId::SioDevice => &[],
            ClassId::PbiDevice => PBI_DEVICE_METHODS,
            ClassId::Clock => CLOCK_METHODS,
            ClassId::Console => CONSOLE_METHODS,
            ClassId::ControllerPort => CONTROLLER_PORT_METHODS,
            ClassId::Debug => DEBUG_METHODS,
            ClassId::Image => IMAGE_METHODS,
            ClassId::VideoOutput => VIDEO_OUTPUT_METHODS,
            ClassId::Sound => SOUND_METHODS,
            ClassId::SoundParams => SOUND_PARAMS_METHODS,
            ClassId::Emulator => EMULATOR_METHODS,
        }
    }
    /// Returns the index and description of a method.
    pub fn find_method(self, name: &str) -> Option<(u16, &'static MethodDesc)> {
        self.methods().iter().enumerate()
            .find(|(_, m)| m.name == name)
            .map(|(i, m)| (i as u16, m))
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A reference to a runtime object: its class and an index into the objects of that class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub class: ClassId,
    pub index: u32,
}

impl ObjectRef {
    pub const fn new(class: ClassId, index: u32) -> Self {
        ObjectRef { class, index }
    }
}

/// Variables that describe the current control-layer access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpecialVar {
    Address = 0,
    Value = 1,
}

pub const SPECIAL_VAR_COUNT: usize = 2;

/// Variables private to each thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ThreadVar {
    Timestamp = 0,
    Device = 1,
    Command = 2,
    Aux1 = 3,
    Aux2 = 4,
    Aux = 5,
}

pub const THREAD_VAR_COUNT: usize = 8;

impl SpecialVar {
    pub fn from_name(name: &str) -> Option<SpecialVar> {
        match name {
            "address" => Some(SpecialVar::Address),
            "value" => Some(SpecialVar::Value),
            _ => None
        }
    }
}

impl ThreadVar {
    pub fn from_name(name: &str) -> Option<ThreadVar> {
        Some(match name {
            "timestamp" => ThreadVar::Timestamp,
            "device" => ThreadVar::Device,
            "command" => ThreadVar::Command,
            "aux1" => ThreadVar::Aux1,
            "aux2" => ThreadVar::Aux2,
            "aux" => ThreadVar::Aux,
            _ => return None
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add, Sub, Mul, Div, Mod,
    And, Or, Xor, Shl, Shr,
    Lt, Le, Gt, Ge, Eq, Ne,
}

impl BinOp {
    /// Evaluates the operator with 32-bit wrapping semantics. Division by zero yields 0.
    pub fn apply(self, a: i32, b: i32) -> i32 {
        match self {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::Div => if b == 0 { 0 } else { a.wrapping_div(b) },
            BinOp::Mod => if b == 0 { 0 } else { a.wrapping_rem(b) },
            BinOp::And => a & b,
            BinOp::Or => a | b,
            BinOp::Xor => a ^ b,
            BinOp::Shl => a.wrapping_shl(b as u32 & 31),
            BinOp::Shr => a.wrapping_shr(b as u32 & 31),
            BinOp::Lt => (a < b) as i32,
            BinOp::Le => (a <= b) as i32,
            BinOp::Gt => (a > b) as i32,
            BinOp::Ge => (a >= b) as i32,
            BinOp::Eq => (a == b) as i32,
            BinOp::Ne => (a != b) as i32,
        }
    }
}

pub type FunctionId = u32;

/// A VM instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Int(i32),
    Str(u32),
    Object(ObjectRef),
    Function(FunctionId),
    /// Pushes the running thread's object.
    CurrentThread,
    LoadLocal(u16),
    StoreLocal(u16),
    LoadGlobal(u32),
    StoreGlobal(u32),
    LoadSpecial(SpecialVar),
    StoreSpecial(SpecialVar),
    LoadThreadVar(ThreadVar),
    StoreThreadVar(ThreadVar),
    Neg,
    Not,
    BitNot,
    Binary(BinOp),
    Jump(u32),
    JumpIfFalse(u32),
    Pop,
    Call { function: FunctionId, argc: u8 },
    CallMethod { class: ClassId, method: u16, argc: u8 },
    Return,
    ReturnInt,
}

/// Where a function may be run from, with respect to suspension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallContext {
    /// Must run to completion, e.g. control-layer accesses.
    Sync,
    /// SIO command scripts.
    Sio,
    /// Event handlers and script threads.
    Thread,
}

impl CallContext {
    pub fn allowed(self) -> MethodFlags {
        match self {
            CallContext::Sync => MethodFlags::empty(),
            CallContext::Sio => MethodFlags::ASYNC_SIO,
            CallContext::Thread => MethodFlags::ASYNC_RAW_SIO,
        }
    }
}

/// A compiled script function.
#[derive(Clone, Debug, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: u8,
    /// Parameters and local variables.
    pub locals: u16,
    pub returns_int: bool,
    /// Set if the function may suspend.
    pub is_async: bool,
    /// The contexts the function may suspend in, meaningful only if `is_async`.
    pub async_contexts: MethodFlags,
    pub code: Vec<Op>,
}

impl Function {
    /// Returns `true` if the function may run in the given context.
    pub fn runs_in(&self, context: CallContext) -> bool {
        !self.is_async || self.async_contexts.contains(context.allowed()) && context != CallContext::Sync
    }
}

/// Everything compiled from a configuration's scripts.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Program {
    pub functions: Vec<Function>,
    pub strings: Vec<String>,
    /// Initial values of global integer variables.
    pub globals: Vec<i32>,
    /// Names of declared threads, in declaration order.
    pub threads: Vec<String>,
}

impl Program {
    pub fn function(&self, id: FunctionId) -> Option<&Function> {
        self.functions.get(id as usize)
    }

    pub fn string(&self, id: u32) -> &str {
        self.strings.get(id as usize).map(String::as_str).unwrap_or("")
    }
    /// Interns a string constant.
    pub fn add_string(&mut self, s: &str) -> u32 {
        match self.strings.iter().position(|x| x == s) {
            Some(i) => i as u32,
            None => {
                self.strings.push(s.to_string());
                (self.strings.len() - 1) as u32
            }
        }
    }
}
