/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Turns a device configuration into the objects, address bindings and compiled scripts of a
//! custom device.
//!
//! A configuration is processed in declaration order, so objects may only refer to objects
//! declared before them. Scripts attached to objects and events are compiled after all
//! declarations, which lets them call functions and use objects declared later.
use core::fmt;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

use atarusty_core::memory::{AccessMode, PRI_CARTRIDGE1, PRI_EXTSEL, PRI_HARDWARE_OVERLAY, PRI_PBI};

use crate::objects::*;
use crate::vm::ast::{Data, DataKind, Decl, FunctionDef, Loc, Member};
use crate::vm::bytecode::Op;
use crate::vm::compile::Symbol;
use crate::vm::parse::parse;
use crate::vm::{CallContext, ClassId, CompileError, Compiler, FunctionId, ObjectRef, Program};

/// The lowest network port a device may connect to.
pub const MIN_NETWORK_PORT: u32 = 1024;
/// The highest network port a device may connect to.
pub const MAX_NETWORK_PORT: u32 = 49150;
/// The largest image file accepted.
pub const MAX_IMAGE_FILE_SIZE: usize = 256 << 20;
/// The largest image width or height.
pub const MAX_IMAGE_DIMENSION: u32 = 65536;

type Result<T> = core::result::Result<T, CompileError>;

/// Events scripts can be bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceEvent {
    Init,
    ColdReset,
    WarmReset,
    VBlank,
    SioCommandChanged,
    SioMotorChanged,
    SioReceivedByte,
    PbiSelect,
    PbiDeselect,
    NetworkInterrupt,
}

impl DeviceEvent {
    pub const ALL: [DeviceEvent; 10] = [
        DeviceEvent::Init, DeviceEvent::ColdReset, DeviceEvent::WarmReset, DeviceEvent::VBlank,
        DeviceEvent::SioCommandChanged, DeviceEvent::SioMotorChanged, DeviceEvent::SioReceivedByte,
        DeviceEvent::PbiSelect, DeviceEvent::PbiDeselect, DeviceEvent::NetworkInterrupt,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DeviceEvent::Init => "init",
            DeviceEvent::ColdReset => "cold_reset",
            DeviceEvent::WarmReset => "warm_reset",
            DeviceEvent::VBlank => "vblank",
            DeviceEvent::SioCommandChanged => "sio_command_changed",
            DeviceEvent::SioMotorChanged => "sio_motor_changed",
            DeviceEvent::SioReceivedByte => "sio_received_byte",
            DeviceEvent::PbiSelect => "pbi_select",
            DeviceEvent::PbiDeselect => "pbi_deselect",
            DeviceEvent::NetworkInterrupt => "network_interrupt",
        }
    }

    pub fn from_name(name: &str) -> Option<DeviceEvent> {
        DeviceEvent::ALL.iter().copied().find(|e| e.name() == name)
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// An error that prevented a configuration from being loaded.
#[non_exhaustive]
#[derive(Debug)]
pub enum ConfigError {
    /// The configuration file itself could not be read.
    Io { path: String, error: io::Error },
    /// The configuration is invalid. Lines and columns are 1-based.
    Compile { path: String, line: u32, column: u32, message: String },
}

impl ConfigError {
    fn compile(path: &str, source: &str, loc: Loc, message: String) -> Self {
        let (line, column) = loc.line_col(source);
        ConfigError::Compile { path: path.to_string(), line, column, message }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { error, .. } => Some(error),
            _ => None
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, error } => write!(f, "{}: {}", path, error),
            ConfigError::Compile { path, line, column, message } => {
                write!(f, "{}({},{}): {}", path, line, column, message)
            }
        }
    }
}

impl From<ConfigError> for io::Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Io { error, .. } => error,
            err => io::Error::new(io::ErrorKind::InvalidData, err)
        }
    }
}

/// The size and modification time of a file a configuration depends on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileStamp {
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl FileStamp {
    /// Returns `None` if the file can't be examined.
    pub fn of(path: &Path) -> Option<FileStamp> {
        let meta = fs::metadata(path).ok()?;
        Some(FileStamp { size: meta.len(), modified: meta.modified().ok() })
    }
}

/// A file whose changes trigger a reload of the configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedFile {
    pub path: PathBuf,
    /// `None` if the file was missing, so it is reloaded once it appears.
    pub stamp: Option<FileStamp>,
}

impl TrackedFile {
    pub fn new(path: PathBuf) -> Self {
        let stamp = FileStamp::of(&path);
        TrackedFile { path, stamp }
    }

    pub fn is_changed(&self) -> bool {
        FileStamp::of(&self.path) != self.stamp
    }
}

/// Supplies the files a configuration refers to by name.
pub trait Resources {
    fn read(&mut self, name: &str) -> io::Result<Vec<u8>>;
    /// The file to watch for changes of the resource.
    fn track(&self, _name: &str) -> Option<TrackedFile> {
        None
    }
}

/// Resources in the directory of the configuration file.
#[derive(Clone, Debug)]
pub struct DirResources {
    base: PathBuf,
}

impl DirResources {
    pub fn new<P: Into<PathBuf>>(base: P) -> Self {
        DirResources { base: base.into() }
    }
    /// Resources next to the given configuration file.
    pub fn beside(config_path: &Path) -> Self {
        let base = config_path.parent().map(Path::to_path_buf).unwrap_or_default();
        DirResources { base }
    }
}

impl Resources for DirResources {
    fn read(&mut self, name: &str) -> io::Result<Vec<u8>> {
        fs::read(self.base.join(name))
    }

    fn track(&self, name: &str) -> Option<TrackedFile> {
        Some(TrackedFile::new(self.base.join(name)))
    }
}

impl Resources for HashMap<String, Vec<u8>> {
    fn read(&mut self, name: &str) -> io::Result<Vec<u8>> {
        self.get(name).cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "resource not found"))
    }
}

/// A device without resources.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoResources;

impl Resources for NoResources {
    fn read(&mut self, _name: &str) -> io::Result<Vec<u8>> {
        Err(io::Error::new(io::ErrorKind::NotFound, "resource not found"))
    }
}

/// What an SIO command transfers by itself, before its script runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferSource {
    Segment(u32),
    /// Constant data, always sent to the computer.
    Blob(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AutoTransfer {
    pub source: TransferSource,
    pub offset: u32,
    pub length: u32,
    /// Data is received from the computer into the segment.
    pub write: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SioCommandDef {
    pub allow_accel: bool,
    pub auto_transfer: Option<AutoTransfer>,
    pub script: Option<FunctionId>,
}

impl Default for SioCommandDef {
    fn default() -> Self {
        SioCommandDef { allow_accel: true, auto_transfer: None, script: None }
    }
}

/// A declared SIO device, answering for one or more device ids.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SioDeviceDef {
    pub allow_accel: bool,
    /// Command ids to indices into [SioTable::commands]. Commands may be shared by ids.
    pub commands: Vec<Option<usize>>,
}

impl Default for SioDeviceDef {
    fn default() -> Self {
        SioDeviceDef { allow_accel: true, commands: vec![None; 256] }
    }
}

/// The SIO devices of a configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SioTable {
    pub devices: Vec<SioDeviceDef>,
    /// Device ids to indices into [SioTable::devices].
    pub device_map: Vec<Option<usize>>,
    pub commands: Vec<SioCommandDef>,
}

impl Default for SioTable {
    fn default() -> Self {
        SioTable { devices: Vec::new(), device_map: vec![None; 256], commands: Vec::new() }
    }
}

impl SioTable {
    pub fn device(&self, device_id: u8) -> Option<&SioDeviceDef> {
        self.device_map[device_id as usize].and_then(|i| self.devices.get(i))
    }
    /// Looks up the handler of a command sent to a device.
    pub fn lookup(&self, device_id: u8, command: u8) -> Option<(&SioDeviceDef, &SioCommandDef)> {
        let device = self.device(device_id)?;
        let cmd = device.commands[command as usize].and_then(|i| self.commands.get(i))?;
        Some((device, cmd))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PbiConfig {
    /// A single bit selecting the device in `$D1FF`.
    pub device_id: u8,
    pub has_irq: bool,
}

/// Everything a configuration declares.
#[derive(Clone, Debug, Default)]
pub struct DeviceConfig {
    /// The display name of the device.
    pub name: Option<String>,
    pub network_port: Option<u16>,
    pub program: Program,
    pub segments: Vec<Segment>,
    pub layers: Vec<MemoryLayer>,
    /// Functions of script bindings, referred to by [AddressBinding::Script].
    pub binding_scripts: Vec<FunctionId>,
    pub sio: Option<SioTable>,
    pub pbi: Option<PbiConfig>,
    /// The port index of each controller port object.
    pub controller_ports: Vec<u8>,
    pub console_count: u32,
    pub images: Vec<Image>,
    pub video_outputs: Vec<VideoOutput>,
    pub sounds: Vec<Sound>,
    pub sound_params: Vec<SoundParams>,
    pub events: [Option<FunctionId>; 10],
    pub tracked_files: Vec<TrackedFile>,
}

impl DeviceConfig {
    pub fn event(&self, event: DeviceEvent) -> Option<FunctionId> {
        self.events[event.index()]
    }
    /// Returns `true` if any tracked file changed since the configuration was loaded.
    pub fn is_stale(&self) -> bool {
        self.tracked_files.iter().any(TrackedFile::is_changed)
    }
}

/// Loads a configuration file, with resources resolved beside it.
pub fn load_file(path: &Path, allow_unsafe: bool, hot_reload: bool) -> core::result::Result<DeviceConfig, ConfigError> {
    let display = path.display().to_string();
    let source = fs::read_to_string(path)
                 .map_err(|error| ConfigError::Io { path: display.clone(), error })?;
    let mut resources = DirResources::beside(path);
    let mut config = compile_config(&source, &display, &mut resources, allow_unsafe)?;
    if hot_reload {
        config.tracked_files.insert(0, TrackedFile::new(path.to_path_buf()));
    }
    else {
        config.tracked_files.clear();
    }
    Ok(config)
}

/// Compiles a configuration. `path` is only used in error messages.
pub fn compile_config(
        source: &str,
        path: &str,
        resources: &mut dyn Resources,
        allow_unsafe: bool
    ) -> core::result::Result<DeviceConfig, ConfigError>
{
    let decls = parse(source)
                .map_err(|e| ConfigError::compile(path, source, e.loc, e.message))?;
    let mut builder = Builder::new(resources, allow_unsafe);
    builder.build(&decls)
           .map_err(|e| ConfigError::compile(path, source, e.loc, e.message))?;
    let config = builder.finish();
    debug!("custom device: {} segments, {} layers, {} functions",
           config.segments.len(), config.layers.len(), config.program.functions.len());
    Ok(config)
}

fn error<T, S: Into<String>>(loc: Loc, message: S) -> Result<T> {
    Err(CompileError::new(loc, message))
}

fn int_of(value: &Data) -> Option<i32> {
    match value.kind {
        DataKind::Int(v) => Some(v),
        DataKind::Bool(b) => Some(b as i32),
        _ => None
    }
}

fn parse_u32(value: &Data) -> Result<u32> {
    match int_of(value) {
        Some(v) if v >= 0 => Ok(v as u32),
        _ => error(value.loc, "Value out of range")
    }
}

fn parse_u8(value: &Data) -> Result<u8> {
    let v = parse_u32(value)?;
    if v > 0xFF {
        return error(value.loc, "Value out of range.")
    }
    Ok(v as u8)
}

fn parse_str(value: &Data) -> Result<&str> {
    match &value.kind {
        DataKind::Str(s) => Ok(s),
        _ => error(value.loc, "Value out of range")
    }
}

fn parse_bool(value: &Data) -> Result<bool> {
    match int_of(value) {
        Some(v) => Ok(v != 0),
        None => error(value.loc, "Expected boolean value")
    }
}

/// Parses a byte string given as an array, an ASCII string or a single byte.
fn parse_blob(value: &Data) -> Result<Vec<u8>> {
    match &value.kind {
        DataKind::Array(items) => {
            if items.is_empty() {
                return error(value.loc, "Array cannot be empty")
            }
            items.iter().map(|item| match int_of(item) {
                Some(v) if (-128..=255).contains(&v) => Ok(v as u8),
                Some(_) => error(item.loc, "Value out of range"),
                None => error(item.loc, "Integer expected")
            }).collect()
        }
        DataKind::Str(s) => {
            if s.is_empty() {
                return error(value.loc, "String cannot be empty")
            }
            if !s.bytes().all(|c| (0x20..0x7F).contains(&c)) {
                return error(value.loc, "String data must be ASCII.")
            }
            Ok(s.as_bytes().to_vec())
        }
        _ => Ok(vec![parse_u8(value)?])
    }
}

/// Parses an array of little-endian words.
fn parse_blob16(value: &Data) -> Result<Vec<u8>> {
    let items = match &value.kind {
        DataKind::Array(items) => items,
        _ => return error(value.loc, "Array expected")
    };
    if items.is_empty() {
        return error(value.loc, "Array cannot be empty")
    }
    let mut data = Vec::with_capacity(items.len() * 2);
    for item in items.iter() {
        match int_of(item) {
            Some(v) if (-32768..=65535).contains(&v) => data.extend_from_slice(&(v as u16).to_le_bytes()),
            Some(_) => return error(item.loc, "Value out of range"),
            None => return error(item.loc, "Integer expected")
        }
    }
    Ok(data)
}

/// Takes members of a data object by name, making sure all of them get used.
struct Members<'a> {
    root: &'a Data,
    members: Vec<&'a Member>,
}

impl<'a> Members<'a> {
    fn new(root: &'a Data) -> Result<Self> {
        match &root.kind {
            DataKind::Object(members) => Ok(Members { root, members: members.iter().collect() }),
            _ => error(root.loc, "Expected data object")
        }
    }

    fn optional(&mut self, name: &str) -> Option<&'a Data> {
        let pos = self.members.iter().position(|m| m.name == name)?;
        Some(&self.members.remove(pos).value)
    }

    fn required(&mut self, name: &str) -> Result<&'a Data> {
        match self.optional(name) {
            Some(value) => Ok(value),
            None => error(self.root.loc, format!("Required member '{}' not found", name))
        }
    }

    fn required_u32(&mut self, name: &str) -> Result<u32> {
        let value = self.required(name)?;
        match int_of(value) {
            Some(v) if v >= 0 => Ok(v as u32),
            Some(_) => error(value.loc, "Negative integer not allowed"),
            None => error(value.loc, "Integer expected")
        }
    }

    fn required_str(&mut self, name: &str) -> Result<&'a str> {
        let value = self.required(name)?;
        match &value.kind {
            DataKind::Str(s) => Ok(s),
            _ => error(value.loc, "String expected")
        }
    }

    fn optional_i32(&mut self, name: &str) -> Result<Option<(i32, Loc)>> {
        match self.optional(name) {
            Some(value) => match int_of(value) {
                Some(v) => Ok(Some((v, value.loc))),
                None => error(value.loc, "Integer expected")
            }
            None => Ok(None)
        }
    }

    fn optional_bool(&mut self, name: &str) -> Result<Option<bool>> {
        match self.optional(name) {
            Some(value) => match int_of(value) {
                Some(v) => Ok(Some(v != 0)),
                None => error(value.loc, "Boolean expected")
            }
            None => Ok(None)
        }
    }

    fn finish(self) -> Result<()> {
        match self.members.first() {
            Some(m) => error(self.root.loc, format!("Unexpected member '{}'", m.name)),
            None => Ok(())
        }
    }
}

/// Where a compiled script ends up.
#[derive(Clone, Copy, Debug)]
enum ScriptSlot {
    Event(DeviceEvent),
    Binding(usize),
    SioCommand(usize),
    Composite(usize),
    PreCopy(usize),
}

/// A script waiting to be compiled once all declarations are known.
struct PendingScript<'a> {
    value: &'a Data,
    name: String,
    returns_int: bool,
    context: CallContext,
    slot: ScriptSlot,
}

struct Builder<'r, 'a> {
    resources: &'r mut dyn Resources,
    compiler: Compiler,
    config: DeviceConfig,
    pending: Vec<PendingScript<'a>>,
    bound_events: [bool; 10],
    bound_ports: [bool; 4],
}

impl<'r, 'a> Builder<'r, 'a> {
    fn new(resources: &'r mut dyn Resources, allow_unsafe: bool) -> Self {
        Builder {
            resources,
            compiler: Compiler::new(allow_unsafe),
            config: DeviceConfig::default(),
            pending: Vec::new(),
            bound_events: [false; 10],
            bound_ports: [false; 4],
        }
    }

    fn build(&mut self, decls: &'a [Decl]) -> Result<()> {
        for decl in decls.iter() {
            match decl {
                Decl::Option { loc, name, value } => self.set_option(*loc, name, value)?,
                Decl::Object { loc, class, name, init } => {
                    let class_id = match ClassId::from_name(class) {
                        Some(class_id) => class_id,
                        None => return error(*loc, format!("Unknown class '{}'", class))
                    };
                    self.define_object(*loc, class_id, name, init.as_ref())?;
                }
                Decl::Int { loc, name, init } => {
                    self.compiler.declare_int(*loc, name, init.as_ref())?;
                }
                Decl::Function(def) => {
                    self.compiler.declare_function(def)?;
                }
                Decl::Event { loc, name, handler } => self.bind_event(*loc, name, handler)?,
            }
        }
        self.compile_pending()
    }

    fn finish(self) -> DeviceConfig {
        let Builder { compiler, mut config, .. } = self;
        config.program = compiler.finish();
        if config.sio.is_none() && references_sio(&config.program) {
            config.sio = Some(SioTable::default());
        }
        config
    }

    fn set_option(&mut self, loc: Loc, name: &str, value: &Data) -> Result<()> {
        match name {
            "name" => match &value.kind {
                DataKind::Str(s) => self.config.name = Some(s.clone()),
                _ => return error(value.loc, "Option 'name' must be a string")
            }
            "network" => {
                if !matches!(value.kind, DataKind::Object(..)) {
                    return error(value.loc, "Option 'network' must be a data object")
                }
                let mut members = Members::new(value)?;
                let port_value = members.required("port")?;
                let port = parse_u32(port_value)?;
                if !(MIN_NETWORK_PORT..=MAX_NETWORK_PORT).contains(&port) {
                    return error(port_value.loc, "Invalid network port (not in 1024-49150).")
                }
                self.config.network_port = Some(port as u16);
                members.finish()?;
            }
            _ => return error(loc, format!("Unknown option '{}'", name))
        }
        Ok(())
    }

    fn bind_event(&mut self, loc: Loc, name: &str, handler: &'a Data) -> Result<()> {
        let event = match DeviceEvent::from_name(name) {
            Some(event) => event,
            None => return error(loc, format!("Unknown event '{}'", name))
        };
        if core::mem::replace(&mut self.bound_events[event.index()], true) {
            return error(loc, format!("Event '{}' already bound", name))
        }
        self.defer_script(handler, format!("event {}", name), false, CallContext::Thread, ScriptSlot::Event(event))
    }

    fn defer_script(
            &mut self,
            value: &'a Data,
            name: String,
            returns_int: bool,
            context: CallContext,
            slot: ScriptSlot
        ) -> Result<()>
    {
        match value.kind {
            DataKind::Function(..)|DataKind::Ident(..) => {}
            _ => return error(value.loc, "Expected script function")
        }
        self.pending.push(PendingScript { value, name, returns_int, context, slot });
        Ok(())
    }

    fn compile_pending(&mut self) -> Result<()> {
        for script in core::mem::take(&mut self.pending) {
            let id = self.compile_script(&script)?;
            match script.slot {
                ScriptSlot::Event(event) => self.config.events[event.index()] = Some(id),
                ScriptSlot::Binding(index) => self.config.binding_scripts[index] = id,
                ScriptSlot::SioCommand(index) => {
                    if let Some(cmd) = self.config.sio.as_mut().and_then(|t| t.commands.get_mut(index)) {
                        cmd.script = Some(id);
                    }
                }
                ScriptSlot::Composite(index) => self.config.video_outputs[index].composite = Some(id),
                ScriptSlot::PreCopy(index) => self.config.video_outputs[index].pre_copy = Some(id),
            }
        }
        Ok(())
    }

    fn compile_script(&mut self, script: &PendingScript<'_>) -> Result<FunctionId> {
        let loc = script.value.loc;
        let id = match &script.value.kind {
            DataKind::Function(def) => {
                let mut def: FunctionDef = (**def).clone();
                def.returns_int = Some(script.returns_int);
                self.compiler.compile_fragment(&def, &script.name, script.context)?
            }
            DataKind::Ident(name) => match self.compiler.lookup(name) {
                Some(Symbol::Function(id)) => {
                    self.compiler.check_context(loc, id, script.context)?;
                    id
                }
                _ => return error(loc, format!("'{}' is not a function", name))
            }
            _ => return error(loc, "Expected script function")
        };
        match self.compiler.function(id) {
            Some(f) if script.returns_int && !f.returns_int => {
                error(loc, format!("Function '{}' must return an integer", f.name))
            }
            _ => Ok(id)
        }
    }

    fn declare(&mut self, loc: Loc, name: &str, class: ClassId, index: usize) -> Result<()> {
        self.compiler.declare_object(loc, name, ObjectRef::new(class, index as u32))
    }

    fn object_of(&self, value: &Data, class: ClassId) -> Option<u32> {
        match &value.kind {
            DataKind::Ident(name) => match self.compiler.lookup(name) {
                Some(Symbol::Object(obj)) if obj.class == class => Some(obj.index),
                _ => None
            }
            _ => None
        }
    }

    fn define_object(&mut self, loc: Loc, class: ClassId, name: &str, init: Option<&'a Data>) -> Result<()> {
        match class {
            ClassId::Thread => {
                if init.is_some() {
                    return error(loc, "Thread object does not take initializers")
                }
                self.compiler.declare_thread(loc, name).map(drop)
            }
            ClassId::Segment => self.define_segment(loc, name, init),
            ClassId::MemoryLayer => self.define_memory_layer(loc, name, init),
            ClassId::SioDevice => self.define_sio_device(loc, name, init),
            ClassId::PbiDevice => self.define_pbi_device(loc, name, init),
            ClassId::ControllerPort => self.define_controller_port(loc, name, init),
            ClassId::Console => {
                if init.is_some() {
                    return error(loc, "Console object does not take initializers")
                }
                let index = self.config.console_count as usize;
                self.config.console_count += 1;
                self.declare(loc, name, ClassId::Console, index)
            }
            ClassId::Image => self.define_image(loc, name, init),
            ClassId::VideoOutput => self.define_video_output(loc, name, init),
            ClassId::Sound => self.define_sound(loc, name, init),
            ClassId::SoundParams => self.define_sound_params(loc, name, init),
            _ => error(loc, format!("Objects of class '{}' can't be declared", class))
        }
    }

    /// Reads a file named by `value`, which must not point outside of the resource directory.
    fn load_dependency(&mut self, value: &Data) -> Result<Vec<u8>> {
        let name = parse_str(value)?;
        if name.contains(|c| matches!(c, '/'|'\\'|':'|'%')) {
            return error(value.loc, "Source file must be a local filename with no directory component.")
        }
        if let Some(tracked) = self.resources.track(name) {
            self.config.tracked_files.push(tracked);
        }
        self.resources.read(name)
            .map_err(|e| CompileError::new(value.loc, format!("Unable to read '{}': {}", name, e)))
    }

    fn define_segment(&mut self, loc: Loc, name: &str, init: Option<&'a Data>) -> Result<()> {
        let init = match init {
            Some(init) => init,
            None => return error(loc, "Segment object must be initialized")
        };
        if !matches!(init.kind, DataKind::Object(..)) {
            return error(init.loc, "Segment initializer is not an object.")
        }
        let mut members = Members::new(init)?;
        let size = members.required_u32("size")?;
        if size > MAX_SEGMENT_SIZE {
            return error(init.loc, "Total segment size is too large.")
        }
        let pattern = if let Some(source) = members.optional("source") {
            let data = self.load_dependency(source)?;
            let offset = match members.optional("source_offset") {
                Some(v) => parse_u32(v)? as usize,
                None => 0
            };
            let mut bytes = vec![0u8; size as usize];
            if let Some(src) = data.get(offset..) {
                let n = src.len().min(bytes.len());
                bytes[..n].copy_from_slice(&src[..n]);
            }
            InitPattern::Bytes(bytes)
        }
        else if let Some(pattern) = members.optional("init_pattern") {
            let bytes = parse_blob(pattern)?;
            if bytes.len() > size as usize {
                return error(pattern.loc, "Init pattern is larger than the segment size.")
            }
            InitPattern::from_bytes(bytes)
        }
        else if let Some(pattern) = members.optional("init_pattern_word") {
            let bytes = parse_blob16(pattern)?;
            if bytes.len() > size as usize {
                return error(pattern.loc, "Init pattern is larger than the segment size.")
            }
            InitPattern::from_bytes(bytes)
        }
        else {
            InitPattern::default()
        };
        let mut nonvolatile = false;
        if let Some(mode) = members.optional("persistence") {
            match parse_str(mode)? {
                "nonvolatile" => nonvolatile = true,
                "volatile" => {}
                _ => return error(mode.loc, "Unknown segment persistence mode.")
            }
        }
        members.finish()?;
        let index = self.config.segments.len();
        self.declare(loc, name, ClassId::Segment, index)?;
        self.config.segments.push(Segment::new(name, size, pattern, nonvolatile));
        Ok(())
    }

    fn define_memory_layer(&mut self, loc: Loc, name: &str, init: Option<&'a Data>) -> Result<()> {
        let init = match init {
            Some(init) if matches!(init.kind, DataKind::Object(..)) => init,
            Some(init) => return error(init.loc, "Memory layer must be initialized with a data object."),
            None => return error(loc, "Memory layer must be initialized with a data object.")
        };
        let mut members = Members::new(init)?;
        let address = members.required_u32("address")?;
        let size = members.required_u32("size")?;
        if address >= 0x10000 || address & 0xFF != 0 {
            return error(init.loc, "Memory layer address is invalid.")
        }
        if size == 0 || 0x10000 - address < size || size & 0xFF != 0 {
            return error(init.loc, "Memory layer size is invalid.")
        }
        let index = self.config.layers.len();
        self.declare(loc, name, ClassId::MemoryLayer, index)?;

        let mut ml = MemoryLayer {
            name: name.to_string(),
            address,
            size,
            priority: PRI_CARTRIDGE1,
            ..Default::default()
        };

        let mut auto_set = false;
        if let Some(mode) = members.optional("auto_enable") {
            ml.auto_enable = match parse_str(mode)? {
                "pbi" => AutoEnable::Pbi,
                "osrom" => AutoEnable::OsRom,
                "basicrom" => AutoEnable::BasicRom,
                "selftestrom" => AutoEnable::SelfTestRom,
                _ => return error(mode.loc, "Unsupported memory layer auto-enable mode")
            };
            auto_set = true;
        }
        if let Some(auto_pbi) = members.optional("auto_pbi") {
            if parse_bool(auto_pbi)? {
                if self.config.pbi.is_none() {
                    return error(auto_pbi.loc, "pbi_device must be declared for auto_pbi layers")
                }
                if auto_set {
                    return error(auto_pbi.loc, "Cannot use both auto_enable and auto_pbi")
                }
                ml.auto_enable = AutoEnable::Pbi;
            }
        }
        if ml.auto_enable == AutoEnable::Pbi {
            ml.priority = PRI_PBI;
        }
        if let Some(pri) = members.optional("priority") {
            ml.priority = match parse_str(pri)? {
                "pbi" => PRI_PBI,
                "extsel" => PRI_EXTSEL,
                "hwoverlay" => PRI_HARDWARE_OVERLAY,
                _ => return error(pri.loc, "Unsupported memory layer priority mode")
            };
        }

        let mapping = match members.optional("fixed_mapping") {
            Some(mapping) => Some(mapping),
            None => members.optional("segment")
        };
        if let Some(mapping) = mapping {
            self.parse_fixed_mapping(&mut ml, mapping)?;
        }
        else if let Some(control) = members.optional("control") {
            self.parse_control(&mut ml, control)?;
        }
        else {
            return error(init.loc, "Memory layer must have a 'control' or 'segment' member.")
        }

        if let Some(mode) = members.optional("cart_mode") {
            let window = match parse_str(mode)? {
                "left" => CartWindow::Left,
                "right" => CartWindow::Right,
                "cctl" => CartWindow::Cctl,
                "auto" => {
                    let covers = |lo: u32, hi: u32| address >= lo && address + size <= hi;
                    if covers(0xA000, 0xC000) {
                        CartWindow::Left
                    }
                    else if covers(0x8000, 0xA000) {
                        CartWindow::Right
                    }
                    else if covers(0xD500, 0xD600) {
                        CartWindow::Cctl
                    }
                    else {
                        return error(mode.loc, "Cannot use 'auto' mode as memory layer address range does not map to a cartridge region.")
                    }
                }
                _ => return error(mode.loc, "Invalid cartridge mode.")
            };
            ml.rd5_active = window == CartWindow::Left;
            ml.cart_window = Some(window);
        }

        ml.layer_name = members.required_str("name")?
            .chars()
            .map(|c| if (' '..'\x7F').contains(&c) { c } else { '_' })
            .collect();
        members.finish()?;
        self.config.layers.push(ml);
        Ok(())
    }

    fn parse_fixed_mapping(&mut self, ml: &mut MemoryLayer, mapping: &'a Data) -> Result<()> {
        let mut members = Members::new(mapping)?;
        let source = members.required("source")?;
        let segment = match self.object_of(source, ClassId::Segment) {
            Some(segment) => segment,
            None => return error(source.loc, "'source' must be a Segment object")
        };
        let seg_len = self.config.segments[segment as usize].len();
        let offset = match members.optional("offset") {
            Some(value) => {
                let offset = parse_u32(value)?;
                if offset & 0xFF != 0 {
                    return error(value.loc, "Source segment offset is invalid.")
                }
                offset
            }
            None => 0
        };
        if offset >= seg_len || seg_len - offset < ml.size {
            return error(source.loc, format!(
                "Reference to {} bytes at offset {} extends outside of source segment of {} bytes.",
                ml.size, offset, seg_len))
        }
        let mode = members.required("mode")?;
        let (modes, read_only, write_through) = match parse_str(mode)? {
            "r" => (AccessMode::AR, false, false),
            "ro" => (AccessMode::ARW, true, false),
            "w" => (AccessMode::W, false, false),
            "rw" => (AccessMode::ARW, false, false),
            "wt" => (AccessMode::W, false, true),
            _ => return error(mode.loc, "Invalid access mode.")
        };
        ml.segment = Some(segment);
        ml.segment_offset = offset;
        ml.max_offset = seg_len - ml.size;
        ml.enabled_modes = modes;
        ml.read_only = read_only;
        ml.write_through = write_through;
        members.finish()
    }

    fn parse_control(&mut self, ml: &mut MemoryLayer, control: &'a Data) -> Result<()> {
        let items = match &control.kind {
            DataKind::Array(items) => items,
            _ => return error(control.loc, "Control item was not an object.")
        };
        let (address, size) = (ml.address, ml.size);
        ml.read_bindings = vec![AddressBinding::None; size as usize];
        ml.write_bindings = vec![AddressBinding::None; size as usize];
        let mut modes = AccessMode::empty();

        for item in items.iter() {
            if !matches!(item.kind, DataKind::Object(..)) {
                return error(item.loc, "Binding item was not an object.")
            }
            let mut members = Members::new(item)?;
            let address_value = members.required("address")?;
            let at = parse_u32(address_value)?;
            let count = match members.optional("size") {
                Some(v) => parse_u32(v)?,
                None => 1
            };
            if at < address || at >= address + size || (address + size) - at < count {
                return error(address_value.loc, "Binding address is outside of the memory layer.")
            }
            let mode = members.required("mode")?;
            let (read, write) = match parse_str(mode)? {
                "r" => (true, false),
                "w" => (false, true),
                "rw" => (true, true),
                _ => return error(mode.loc, "Invalid binding mode.")
            };
            let range = (at - address) as usize..(at - address + count) as usize;
            if read {
                if ml.read_bindings[range.clone()].iter().any(|b| *b != AddressBinding::None) {
                    return error(item.loc, "Address conflict between two read bindings in the same layer.")
                }
                modes |= AccessMode::AR;
            }
            if write {
                if ml.write_bindings[range.clone()].iter().any(|b| *b != AddressBinding::None) {
                    return error(item.loc, "Address conflict between two write bindings in the same layer.")
                }
                modes |= AccessMode::W;
            }
            let fill = |bindings: &mut Vec<AddressBinding>, enabled: bool, binding: AddressBinding| {
                if enabled {
                    for b in bindings[range.clone()].iter_mut() {
                        *b = binding;
                    }
                }
            };

            if let Some(data) = members.optional("data") {
                let pattern = parse_blob(data)?;
                if !read || write {
                    return error(data.loc, "Data bindings can only be read-only.")
                }
                if pattern.len() == 1 {
                    fill(&mut ml.read_bindings, true, AddressBinding::Const(pattern[0]));
                }
                else {
                    if pattern.len() != count as usize {
                        return error(data.loc, "Data must either be a single byte or the same size as the memory layer.")
                    }
                    for (b, byte) in ml.read_bindings[range.clone()].iter_mut().zip(pattern) {
                        *b = AddressBinding::Const(byte);
                    }
                }
            }
            else if let Some(action) = members.optional("action") {
                match action.kind {
                    DataKind::Str(ref s) if s == "block" => {
                        if read || !write {
                            return error(action.loc, "Block bindings can only be write-only.")
                        }
                        fill(&mut ml.write_bindings, true, AddressBinding::Block);
                    }
                    DataKind::Str(ref s) if s == "network" => {
                        if self.config.network_port.is_none() {
                            return error(action.loc, "Cannot use a network binding with no network connection set up.")
                        }
                        fill(&mut ml.read_bindings, read, AddressBinding::Network);
                        fill(&mut ml.write_bindings, write, AddressBinding::Network);
                    }
                    _ => return error(action.loc, "Unknown action type.")
                }
            }
            else if let Some(variable) = members.optional("variable") {
                let index = match self.compiler.lookup(parse_str(variable)?) {
                    Some(Symbol::Global(index)) => index,
                    Some(_) => return error(variable.loc, "Variable must be of integer type for address binding."),
                    None => return error(variable.loc, "Variable not defined.")
                };
                fill(&mut ml.read_bindings, read, AddressBinding::Variable(index));
                fill(&mut ml.write_bindings, write, AddressBinding::Variable(index));
            }
            else if let Some(script) = members.optional("script") {
                let script_index = self.reserve_binding_script(
                    script, format!("{}.{}", ml.name, at), read)?;
                let mut debug_index = script_index;
                if read {
                    if let Some(debug_script) = members.optional("debug_script") {
                        debug_index = self.reserve_binding_script(
                            debug_script, format!("{}.{}.debug", ml.name, at), true)?;
                    }
                }
                let binding = AddressBinding::Script {
                    script: script_index as u16,
                    debug_script: debug_index as u16
                };
                fill(&mut ml.read_bindings, read, binding);
                fill(&mut ml.write_bindings, write, binding);
            }
            else if let Some(copy) = members.optional("copy_from") {
                let src = parse_u32(copy)?;
                if src < address || src - address >= size || size - (src - address) < count {
                    return error(item.loc, "Binding copy source is outside of memory layer.")
                }
                let from = (src - address) as usize;
                if read {
                    let copied = ml.read_bindings[from..from + count as usize].to_vec();
                    ml.read_bindings[range.clone()].copy_from_slice(&copied);
                }
                if write {
                    let copied = ml.write_bindings[from..from + count as usize].to_vec();
                    ml.write_bindings[range.clone()].copy_from_slice(&copied);
                }
            }
            else {
                return error(item.loc,
                    "No binding type specified; expected one of: data, action, variable, script, or copy_from.")
            }
            members.finish()?;
        }

        if modes.is_empty() {
            return error(control.loc, "No address bindings were specified.")
        }
        ml.enabled_modes = modes;
        Ok(())
    }

    fn reserve_binding_script(&mut self, value: &'a Data, name: String, returns_int: bool) -> Result<usize> {
        let index = self.config.binding_scripts.len();
        if index > u16::MAX as usize {
            return error(value.loc, "Too many binding scripts")
        }
        self.config.binding_scripts.push(0);
        self.defer_script(value, name, returns_int, CallContext::Sync, ScriptSlot::Binding(index))?;
        Ok(index)
    }

    fn define_sio_device(&mut self, loc: Loc, name: &str, init: Option<&'a Data>) -> Result<()> {
        let init = match init {
            Some(init) => init,
            None => return error(loc, "SIODevice object must be initialized.")
        };
        if !matches!(init.kind, DataKind::Object(..)) {
            return error(init.loc, "SIODevice initializer must be an object.")
        }
        let mut members = Members::new(init)?;
        let device_id = members.required_u32("device_id")?;
        if device_id >= 0x100 {
            return error(init.loc, "Invalid SIO device ID.")
        }
        let device_count = match members.optional("device_count") {
            Some(v) => parse_u32(v)?,
            None => 1
        };
        if 0x100 - device_id < device_count {
            return error(init.loc, "Invalid SIO device ID range.")
        }
        let table = self.config.sio.get_or_insert_with(SioTable::default);
        let index = table.devices.len();
        self.declare(loc, name, ClassId::SioDevice, index)?;

        let table = self.config.sio.get_or_insert_with(SioTable::default);
        for id in device_id..device_id + device_count {
            let slot = &mut table.device_map[id as usize];
            if slot.is_some() {
                return error(init.loc, "SIO device already defined.")
            }
            *slot = Some(index);
        }
        let mut device = SioDeviceDef::default();
        if let Some(allow) = members.optional("allow_accel") {
            device.allow_accel = parse_bool(allow)?;
        }
        let commands = match &members.required("commands")?.kind {
            DataKind::Array(commands) => commands,
            _ => return error(init.loc, "SIO device requires commands array.")
        };
        table.devices.push(device);

        for command in commands.iter() {
            self.define_sio_command(index, name, command)?;
        }
        members.finish()
    }

    fn define_sio_command(&mut self, device: usize, device_name: &str, command: &'a Data) -> Result<()> {
        let mut members = Members::new(command)?;
        let id_value = members.required("id")?;
        let mut copied = false;
        let cmd_index = {
            let table = self.config.sio.get_or_insert_with(SioTable::default);
            if let Some(copy_from) = members.optional("copy_from") {
                let src = parse_u32(copy_from)?;
                if src >= 0x100 {
                    return error(copy_from.loc, "Invalid source command ID.")
                }
                copied = true;
                match table.devices[device].commands[src as usize] {
                    Some(i) => i,
                    None => return error(copy_from.loc, "Source command is not defined.")
                }
            }
            else {
                table.commands.push(SioCommandDef::default());
                table.commands.len() - 1
            }
        };
        if let Some(allow) = members.optional("allow_accel") {
            let allow = parse_bool(allow)?;
            if let Some(table) = self.config.sio.as_mut() {
                table.commands[cmd_index].allow_accel = allow;
            }
        }
        let table = self.config.sio.get_or_insert_with(SioTable::default);
        let commands = &mut table.devices[device].commands;
        let command_id = match &id_value.kind {
            DataKind::Str(s) if s == "default" => {
                for entry in commands.iter_mut().filter(|e| e.is_none()) {
                    *entry = Some(cmd_index);
                }
                None
            }
            _ => {
                let id = parse_u32(id_value)?;
                if id >= 0x100 {
                    return error(id_value.loc, "Invalid SIO command ID.")
                }
                if commands[id as usize].is_some() {
                    return error(id_value.loc, "Conflicting command ID in SIO device command list.")
                }
                commands[id as usize] = Some(cmd_index);
                Some(id)
            }
        };
        if copied {
            return Ok(())
        }

        if let Some(transfer) = members.optional("auto_transfer") {
            let auto = if let DataKind::Array(..) = transfer.kind {
                let blob = parse_blob(transfer)?;
                AutoTransfer {
                    length: blob.len() as u32,
                    source: TransferSource::Blob(blob),
                    offset: 0,
                    write: false,
                }
            }
            else {
                let mut tm = Members::new(transfer)?;
                let seg_value = tm.required("segment")?;
                let segment = match self.object_of(seg_value, ClassId::Segment) {
                    Some(segment) => segment,
                    None => return error(seg_value.loc, "'segment' member must be set to an object of type Segment")
                };
                let write = match parse_str(tm.required("mode")?)? {
                    "read" => false,
                    "write" => true,
                    _ => return error(transfer.loc, "Unknown auto-transfer mode.")
                };
                let offset = match tm.optional("offset") {
                    Some(v) => parse_u32(v)?,
                    None => 0
                };
                let length = tm.required_u32("length")?;
                if length < 1 || length > MAX_FRAME_LENGTH as u32 {
                    return error(transfer.loc, "Invalid transfer length (must be 1-8192 bytes).")
                }
                let seg_len = self.config.segments[segment as usize].len();
                if offset >= seg_len || seg_len - offset < length {
                    return error(transfer.loc, "Offset/length specifies range outside of segment.")
                }
                tm.finish()?;
                AutoTransfer { source: TransferSource::Segment(segment), offset, length, write }
            };
            if let Some(table) = self.config.sio.as_mut() {
                table.commands[cmd_index].auto_transfer = Some(auto);
            }
        }
        else if let Some(script) = members.optional("script") {
            let name = match command_id {
                Some(id) => format!("{}.command_{:02x}", device_name, id),
                None => format!("{}.default", device_name)
            };
            self.defer_script(script, name, false, CallContext::Sio, ScriptSlot::SioCommand(cmd_index))?;
        }
        members.finish()
    }

    fn define_controller_port(&mut self, loc: Loc, name: &str, init: Option<&'a Data>) -> Result<()> {
        let init = match init {
            Some(init) => init,
            None => return error(loc, "ControllerPort object must be initialized.")
        };
        let port = parse_u32(init)?;
        if port >= 4 {
            return error(init.loc, "Invalid controller port index.")
        }
        if core::mem::replace(&mut self.bound_ports[port as usize], true) {
            return error(init.loc, "Controller port is already bound.")
        }
        let index = self.config.controller_ports.len();
        self.declare(loc, name, ClassId::ControllerPort, index)?;
        self.config.controller_ports.push(port as u8);
        Ok(())
    }

    fn define_pbi_device(&mut self, loc: Loc, name: &str, init: Option<&'a Data>) -> Result<()> {
        if self.config.pbi.is_some() {
            return error(loc, "PBI device already defined")
        }
        let init = match init {
            Some(init) => init,
            None => return error(loc, "PBIDevice object requires initialization")
        };
        let mut members = Members::new(init)?;
        let device_id = members.required_u32("device_id")?;
        if device_id == 0 || device_id >= 0x100 || !device_id.is_power_of_two() {
            return error(init.loc, "PBI device ID must be a power of two byte value.")
        }
        let has_irq = match members.optional("has_irq") {
            Some(v) => parse_bool(v)?,
            None => false
        };
        self.config.pbi = Some(PbiConfig { device_id: device_id as u8, has_irq });
        self.declare(loc, name, ClassId::PbiDevice, 0)?;
        members.finish()
    }

    fn define_image(&mut self, loc: Loc, name: &str, init: Option<&'a Data>) -> Result<()> {
        let init = match init {
            Some(init) => init,
            None => return error(loc, "Image object requires initialization")
        };
        let mut members = Members::new(init)?;
        let image = if let Some(source) = members.optional("source") {
            let data = self.load_dependency(source)?;
            if data.len() >= MAX_IMAGE_FILE_SIZE {
                return error(source.loc, "Image source file is too large (>256MB)")
            }
            decode_png(&data).map_err(|message| CompileError::new(source.loc, message))?
        }
        else {
            let width = members.required_u32("width")?;
            let height = members.required_u32("height")?;
            validate_image_size(width, height).map_err(|message| CompileError::new(init.loc, message))?;
            Image::new(width, height)
        };
        members.finish()?;
        let index = self.config.images.len();
        self.declare(loc, name, ClassId::Image, index)?;
        self.config.images.push(image);
        Ok(())
    }

    fn define_video_output(&mut self, loc: Loc, name: &str, init: Option<&'a Data>) -> Result<()> {
        let init = match init {
            Some(init) => init,
            None => return error(loc, "VideoOutput object requires initialization")
        };
        let mut members = Members::new(init)?;
        let display_name = members.required_str("display_name")?;
        let index = self.config.video_outputs.len();
        self.config.video_outputs.push(VideoOutput::new(format!("customdevice_{}", name), display_name.to_string()));
        if let Some(script) = members.optional("composite") {
            self.defer_script(script, format!("{}.composite", name), false, CallContext::Sync,
                              ScriptSlot::Composite(index))?;
        }
        if let Some(script) = members.optional("pre_copy") {
            self.defer_script(script, format!("{}.pre_copy", name), false, CallContext::Sync,
                              ScriptSlot::PreCopy(index))?;
        }
        members.finish()?;
        self.declare(loc, name, ClassId::VideoOutput, index)
    }

    fn define_sound(&mut self, loc: Loc, name: &str, init: Option<&'a Data>) -> Result<()> {
        let init = match init {
            Some(init) => init,
            None => return error(loc, "Sound object requires initialization")
        };
        let mut members = Members::new(init)?;
        let source = members.required("source_file")?;
        if !matches!(source.kind, DataKind::Str(..)) {
            return error(source.loc, "String expected")
        }
        let data = self.load_dependency(source)?;
        let (samples, sample_rate) = decode_wav(&data)
            .ok_or_else(|| CompileError::new(source.loc, "Source audio file has unsupported format"))?;
        members.finish()?;
        let index = self.config.sounds.len();
        self.declare(loc, name, ClassId::Sound, index)?;
        self.config.sounds.push(Sound {
            name: name.to_string(),
            source_file: parse_str(source)?.to_string(),
            samples,
            sample_rate
        });
        Ok(())
    }

    fn define_sound_params(&mut self, loc: Loc, name: &str, init: Option<&'a Data>) -> Result<()> {
        let mut params = SoundParams::default();
        if let Some(init) = init {
            let mut members = Members::new(init)?;
            if let Some((pan, at)) = members.optional_i32("pan")? {
                if !(-100..=100).contains(&pan) {
                    return error(at, "Sound panning value must be in range [-100, +100]")
                }
                params.pan = pan as f32 / 100.0;
            }
            if let Some((volume, at)) = members.optional_i32("volume")? {
                if !(0..=100).contains(&volume) {
                    return error(at, "Sound volume value must be in range [0, 100]")
                }
                params.volume = volume as f32 / 100.0;
            }
            if let Some((rate, at)) = members.optional_i32("rate")? {
                if !(10..=1000).contains(&rate) {
                    return error(at, "Sound rate value must be in range [10, 1000]")
                }
                params.rate = rate as f32 / 100.0;
            }
            if let Some(looping) = members.optional_bool("looping")? {
                params.looping = looping;
            }
            members.finish()?;
        }
        let index = self.config.sound_params.len();
        self.declare(loc, name, ClassId::SoundParams, index)?;
        self.config.sound_params.push(params);
        Ok(())
    }
}

/// Returns `true` if any function uses the `sio` object.
fn references_sio(program: &Program) -> bool {
    program.functions.iter()
        .flat_map(|f| f.code.iter())
        .any(|op| matches!(op,
            Op::Object(ObjectRef { class: ClassId::Sio, .. })|Op::CallMethod { class: ClassId::Sio, .. }))
}

fn validate_image_size(width: u32, height: u32) -> core::result::Result<(), &'static str> {
    if width == 0 || height == 0 {
        return Err("Width or height cannot be zero")
    }
    if width > MAX_IMAGE_DIMENSION || height > MAX_IMAGE_DIMENSION {
        return Err("Image width or height cannot exceed 65536")
    }
    if width as u64 * height as u64 > MAX_IMAGE_PIXELS as u64 {
        return Err("Image exceeds size limit of 4M pixels")
    }
    Ok(())
}

/// Decodes a PNG file to an image, dropping its alpha channel.
fn decode_png(data: &[u8]) -> core::result::Result<Image, &'static str> {
    let mut decoder = png::Decoder::new(data);
    decoder.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);
    let mut reader = decoder.read_info().map_err(|_| "Unsupported image file (must be PNG format)")?;
    let (width, height) = {
        let info = reader.info();
        (info.width, info.height)
    };
    validate_image_size(width, height)?;
    let mut buf = vec![0u8; reader.output_buffer_size()];
    let frame = reader.next_frame(&mut buf).map_err(|_| "Unable to decode PNG image")?;
    let bytes = &buf[..frame.buffer_size()];
    let rgb = |r: u8, g: u8, b: u8| (r as u32) << 16 | (g as u32) << 8 | b as u32;
    let stride = frame.line_size;
    let channels = match frame.color_type {
        png::ColorType::Grayscale => 1,
        png::ColorType::GrayscaleAlpha => 2,
        png::ColorType::Rgb => 3,
        png::ColorType::Rgba => 4,
        png::ColorType::Indexed => return Err("Unable to decode PNG image"),
    };
    let mut pixels = Vec::with_capacity(width as usize * height as usize);
    for row in bytes.chunks(stride).take(height as usize) {
        for px in row.chunks_exact(channels).take(width as usize) {
            pixels.push(match channels {
                1|2 => rgb(px[0], px[0], px[0]),
                _ => rgb(px[0], px[1], px[2])
            });
        }
    }
    Image::from_pixels(width, height, pixels).ok_or("Unable to decode PNG image")
}

/// Decodes a WAV file, downmixed to mono. Returns the samples and the sample rate.
fn decode_wav(data: &[u8]) -> Option<(Vec<i16>, f32)> {
    let reader = hound::WavReader::new(Cursor::new(data)).ok()?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;
    let samples: Vec<i32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, bits) if bits <= 16 => {
            let shift = 16 - bits as u32;
            reader.into_samples::<i16>().map(|s| s.map(|v| (v as i32) << shift)).collect::<core::result::Result<_, _>>().ok()?
        }
        (hound::SampleFormat::Int, bits) => {
            let shift = bits.saturating_sub(16) as u32;
            reader.into_samples::<i32>().map(|s| s.map(|v| v >> shift)).collect::<core::result::Result<_, _>>().ok()?
        }
        (hound::SampleFormat::Float, _) => {
            reader.into_samples::<f32>()
                  .map(|s| s.map(|v| (v.max(-1.0).min(1.0) * 32767.0) as i32))
                  .collect::<core::result::Result<_, _>>().ok()?
        }
    };
    let mono = samples.chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().sum();
            (sum + channels as i32 / 2).div_euclid(channels as i32) as i16
        })
        .collect();
    Some((mono, spec.sample_rate as f32))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(src: &str) -> core::result::Result<DeviceConfig, ConfigError> {
        compile_config(src, "test.atdevice", &mut NoResources, false)
    }

    fn compile_err(src: &str) -> String {
        match compile(src) {
            Err(ConfigError::Compile { message, .. }) => message,
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("configuration compiled")
        }
    }

    #[test]
    fn options_are_parsed() {
        let config = compile(r#"
            option "name": "Test device";
            option "network": { port: 6502 };
        "#).unwrap();
        assert_eq!(config.name.as_deref(), Some("Test device"));
        assert_eq!(config.network_port, Some(6502));
        assert_eq!(compile_err(r#"option "network": { port: 80 };"#),
                   "Invalid network port (not in 1024-49150).");
        assert_eq!(compile_err(r#"option "name": 1;"#), "Option 'name' must be a string");
        assert_eq!(compile_err(r#"option "color": 1;"#), "Unknown option 'color'");
    }

    #[test]
    fn errors_carry_path_and_position() {
        let err = compile("\n  Segment s: { size: 16, bogus: 1 };").unwrap_err();
        match &err {
            ConfigError::Compile { path, line, message, .. } => {
                assert_eq!(path, "test.atdevice");
                assert_eq!(*line, 2);
                assert_eq!(message, "Unexpected member 'bogus'");
            }
            e => panic!("unexpected error: {}", e)
        }
        assert!(err.to_string().starts_with("test.atdevice(2,"));
    }

    #[test]
    fn segments_are_initialized() {
        let config = compile(r#"
            Segment a: { size: 8, init_pattern: [1, 2] };
            Segment b: { size: 4, init_pattern_word: [$1234], persistence: "nonvolatile" };
            Segment c: { size: 4, init_pattern: "AB" };
        "#).unwrap();
        assert_eq!(config.segments[0].to_vec(), [1, 2, 1, 2, 1, 2, 1, 2]);
        assert!(!config.segments[0].nonvolatile);
        assert_eq!(config.segments[1].to_vec(), [0x34, 0x12, 0x34, 0x12]);
        assert!(config.segments[1].nonvolatile);
        assert_eq!(config.segments[2].to_vec(), b"ABAB");
        assert_eq!(compile_err("Segment a: { size: 1, init_pattern: [1, 2] };"),
                   "Init pattern is larger than the segment size.");
        assert_eq!(compile_err("Segment a;"), "Segment object must be initialized");
        assert_eq!(compile_err(r#"Segment a: { size: 1, persistence: "forever" };"#),
                   "Unknown segment persistence mode.");
    }

    #[test]
    fn segments_load_from_resources() {
        let mut files = HashMap::new();
        files.insert("rom.bin".to_string(), vec![9u8, 8, 7, 6, 5]);
        let config = compile_config(r#"Segment rom: { size: 4, source: "rom.bin", source_offset: 1 };"#,
                                    "dev", &mut files, false).unwrap();
        assert_eq!(config.segments[0].to_vec(), [8, 7, 6, 5]);
        let err = compile_config(r#"Segment rom: { size: 4, source: "../rom.bin" };"#,
                                 "dev", &mut files, false).unwrap_err();
        assert!(err.to_string().ends_with("Source file must be a local filename with no directory component."));
    }

    #[test]
    fn fixed_mapping_layers_are_validated() {
        let config = compile(r#"
            Segment ram: { size: $2000 };
            MemoryLayer cart: {
                name: "Cart", address: $A000, size: $1000, cart_mode: "auto",
                segment: { source: ram, offset: $1000, mode: "ro" }
            };
        "#).unwrap();
        let ml = &config.layers[0];
        assert_eq!(ml.name, "cart");
        assert_eq!(ml.layer_name, "Cart");
        assert_eq!(ml.segment, Some(0));
        assert_eq!(ml.segment_offset, 0x1000);
        assert_eq!(ml.max_offset, 0x1000);
        assert!(ml.read_only);
        assert_eq!(ml.enabled_modes, AccessMode::ARW);
        assert_eq!(ml.cart_window, Some(CartWindow::Left));
        assert!(ml.rd5_active);
        assert_eq!(ml.priority, PRI_CARTRIDGE1);

        assert_eq!(compile_err(r#"
            Segment ram: { size: $1000 };
            MemoryLayer l: { name: "L", address: $A000, size: $1000, segment: { source: ram, offset: $100, mode: "r" } };
        "#), "Reference to 4096 bytes at offset 256 extends outside of source segment of 4096 bytes.");
        assert_eq!(compile_err(r#"MemoryLayer l: { name: "L", address: $A080, size: $100, control: [] };"#),
                   "Memory layer address is invalid.");
        assert_eq!(compile_err(r#"MemoryLayer l: { name: "L", address: $A000, size: $100 };"#),
                   "Memory layer must have a 'control' or 'segment' member.");
    }

    #[test]
    fn control_bindings_are_built() {
        let config = compile(r#"
            int reg = 5;
            MemoryLayer io: {
                name: "IO\t", address: $D500, size: $100, priority: "hwoverlay",
                control: [
                    { address: $D500, mode: "r", data: $42 },
                    { address: $D501, size: 2, mode: "r", data: [1, 2] },
                    { address: $D503, mode: "rw", variable: "reg" },
                    { address: $D504, mode: "w", action: "block" },
                    { address: $D505, mode: "r", script: function { return value + 1; } },
                    { address: $D506, size: 2, mode: "r", copy_from: $D501 },
                ]
            };
        "#).unwrap();
        let ml = &config.layers[0];
        assert!(ml.is_control());
        assert_eq!(ml.priority, PRI_HARDWARE_OVERLAY);
        assert_eq!(ml.layer_name, "IO_");
        assert_eq!(ml.enabled_modes, AccessMode::AR | AccessMode::W);
        assert_eq!(ml.read_binding(0xD500), AddressBinding::Const(0x42));
        assert_eq!(ml.read_binding(0xD502), AddressBinding::Const(2));
        assert_eq!(ml.read_binding(0xD503), AddressBinding::Variable(0));
        assert_eq!(ml.write_binding(0xD503), AddressBinding::Variable(0));
        assert_eq!(ml.write_binding(0xD504), AddressBinding::Block);
        assert_eq!(ml.read_binding(0xD505), AddressBinding::Script { script: 0, debug_script: 0 });
        assert_eq!(ml.read_binding(0xD507), AddressBinding::Const(2));
        assert_eq!(ml.read_binding(0xD508), AddressBinding::None);
        let f = config.program.function(config.binding_scripts[0]).unwrap();
        assert!(f.returns_int);
    }

    #[test]
    fn binding_errors_are_reported() {
        let layer = |bindings: &str| format!(
            r#"MemoryLayer io: {{ name: "IO", address: $D500, size: $100, control: [{}] }};"#, bindings);
        assert_eq!(compile_err(&layer(r#"{ address: $D600, mode: "r", data: 1 }"#)),
                   "Binding address is outside of the memory layer.");
        assert_eq!(compile_err(&layer(r#"{ address: $D500, mode: "rw", data: 1 }"#)),
                   "Data bindings can only be read-only.");
        assert_eq!(compile_err(&layer(r#"{ address: $D500, mode: "r", action: "block" }"#)),
                   "Block bindings can only be write-only.");
        assert_eq!(compile_err(&layer(r#"{ address: $D500, mode: "r", action: "network" }"#)),
                   "Cannot use a network binding with no network connection set up.");
        assert_eq!(compile_err(&layer(r#"{ address: $D500, mode: "r", variable: "nope" }"#)),
                   "Variable not defined.");
        assert_eq!(compile_err(&layer(r#"{ address: $D500, mode: "r", data: 1 }, { address: $D500, mode: "r", data: 2 }"#)),
                   "Address conflict between two read bindings in the same layer.");
        assert_eq!(compile_err(&layer(r#"{ address: $D500, mode: "r" }"#)),
                   "No binding type specified; expected one of: data, action, variable, script, or copy_from.");
        assert_eq!(compile_err(&layer("")), "No address bindings were specified.");
    }

    #[test]
    fn sio_devices_share_commands() {
        let config = compile(r#"
            Segment buf: { size: 256 };
            SIODevice dev: {
                device_id: $50, device_count: 2,
                commands: [
                    { id: $53, auto_transfer: [1, 2, 3, 4] },
                    { id: $52, allow_accel: false, auto_transfer: { segment: buf, mode: "read", length: 128 } },
                    { id: $57, copy_from: $52 },
                    { id: "default", script: function { sio.nak(); } },
                ]
            };
        "#).unwrap();
        let table = config.sio.as_ref().unwrap();
        let (device, status) = table.lookup(0x51, 0x53).unwrap();
        assert!(device.allow_accel);
        assert_eq!(status.auto_transfer.as_ref().unwrap().source, TransferSource::Blob(vec![1, 2, 3, 4]));
        let (_, read) = table.lookup(0x50, 0x52).unwrap();
        assert!(!read.allow_accel);
        assert_eq!(table.devices[0].commands[0x57], table.devices[0].commands[0x52]);
        let (_, other) = table.lookup(0x50, 0x21).unwrap();
        assert!(other.script.is_some());
        assert!(table.lookup(0x52, 0x53).is_none());

        assert_eq!(compile_err(r#"SIODevice d: { device_id: $31, commands: [ { id: 1 }, { id: 1 } ] };"#),
                   "Conflicting command ID in SIO device command list.");
        assert_eq!(compile_err(r#"SIODevice d: { device_id: $31, commands: [ { id: 2, copy_from: 1 } ] };"#),
                   "Source command is not defined.");
        assert_eq!(compile_err(r#"SIODevice d: { device_id: $FF, device_count: 2, commands: [] };"#),
                   "Invalid SIO device ID range.");
    }

    #[test]
    fn sio_table_exists_when_scripts_use_sio() {
        let config = compile(r#"event "init": function { sio.enable_raw(1); };"#).unwrap();
        assert!(config.sio.is_some());
        let config = compile(r#"event "init": function { debug.log("hi"); };"#).unwrap();
        assert!(config.sio.is_none());
    }

    #[test]
    fn events_compile_after_declarations() {
        let config = compile(r#"
            event "cold_reset": function { later.clear(0); };
            Segment later: { size: 16 };
        "#).unwrap();
        assert!(config.event(DeviceEvent::ColdReset).is_some());
        assert!(config.event(DeviceEvent::Init).is_none());
        assert_eq!(compile_err(r#"event "boot": function { };"#), "Unknown event 'boot'");
        assert_eq!(compile_err(r#"event "init": function { }; event "init": function { };"#),
                   "Event 'init' already bound");
    }

    #[test]
    fn pbi_and_ports_are_declared() {
        let config = compile(r#"
            PBIDevice pbi: { device_id: 2, has_irq: true };
            ControllerPort port2: 1;
            MemoryLayer rom: { name: "PBI ROM", address: $D800, size: $800, auto_pbi: true,
                               control: [ { address: $D800, mode: "r", data: 0 } ] };
        "#).unwrap();
        assert_eq!(config.pbi, Some(PbiConfig { device_id: 2, has_irq: true }));
        assert_eq!(config.controller_ports, [1]);
        assert_eq!(config.layers[0].auto_enable, AutoEnable::Pbi);
        assert_eq!(config.layers[0].priority, PRI_PBI);
        assert_eq!(compile_err("PBIDevice pbi: { device_id: 3 };"),
                   "PBI device ID must be a power of two byte value.");
        assert_eq!(compile_err("ControllerPort a: 0; ControllerPort b: 0;"),
                   "Controller port is already bound.");
        assert_eq!(compile_err("ControllerPort a: 4;"), "Invalid controller port index.");
    }

    #[test]
    fn images_and_sound_params() {
        let config = compile(r#"
            Image img: { width: 320, height: 200 };
            SoundParams quiet: { volume: 25, pan: -100, looping: true };
            SoundParams plain;
        "#).unwrap();
        assert_eq!(config.images[0].width(), 320);
        assert_eq!(config.sound_params[0].volume, 0.25);
        assert_eq!(config.sound_params[0].pan, -1.0);
        assert!(config.sound_params[0].looping);
        assert_eq!(config.sound_params[1], SoundParams::default());
        assert_eq!(compile_err("Image img: { width: 4096, height: 4096 };"),
                   "Image exceeds size limit of 4M pixels");
        assert_eq!(compile_err("SoundParams p: { rate: 5 };"),
                   "Sound rate value must be in range [10, 1000]");
    }

    #[test]
    fn png_images_are_decoded() {
        let mut png_data = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut png_data, 2, 1);
            encoder.set_color(png::ColorType::Rgb);
            encoder.set_depth(png::BitDepth::Eight);
            let mut writer = encoder.write_header().unwrap();
            writer.write_image_data(&[0xFF, 0, 0, 0, 0x80, 0xFF]).unwrap();
        }
        let mut files = HashMap::new();
        files.insert("logo.png".to_string(), png_data);
        files.insert("bad.png".to_string(), b"not a png".to_vec());
        let config = compile_config(r#"Image logo: { source: "logo.png" };"#, "dev", &mut files, false).unwrap();
        let image = &config.images[0];
        assert_eq!((image.width(), image.height()), (2, 1));
        assert_eq!(image.get_pixel(0, 0) as u32 & 0xFFFFFF, 0xFF0000);
        assert_eq!(image.get_pixel(1, 0) as u32 & 0xFFFFFF, 0x0080FF);
        let err = compile_config(r#"Image logo: { source: "bad.png" };"#, "dev", &mut files, false).unwrap_err();
        assert!(err.to_string().ends_with("Unsupported image file (must be PNG format)"));
    }

    #[test]
    fn wav_sounds_are_downmixed() {
        let mut wav = Cursor::new(Vec::new());
        {
            let spec = hound::WavSpec {
                channels: 2,
                sample_rate: 22050,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int
            };
            let mut writer = hound::WavWriter::new(&mut wav, spec).unwrap();
            for &s in [100i16, 300, -50, -150].iter() {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        let mut files = HashMap::new();
        files.insert("beep.wav".to_string(), wav.into_inner());
        let config = compile_config(r#"Sound beep: { source_file: "beep.wav" };"#, "dev", &mut files, false).unwrap();
        assert_eq!(config.sounds[0].samples, [200, -100]);
        assert_eq!(config.sounds[0].sample_rate, 22050.0);
    }

    #[test]
    fn video_outputs_get_scripts() {
        let config = compile(r#"
            Image screen: { width: 8, height: 8 };
            VideoOutput out: { display_name: "Screen", composite: function { out.set_image(screen); } };
        "#).unwrap();
        let vo = &config.video_outputs[0];
        assert_eq!(vo.name, "customdevice_out");
        assert_eq!(vo.display_name, "Screen");
        assert!(vo.composite.is_some());
        assert!(vo.pre_copy.is_none());
        assert_eq!(compile_err(r#"VideoOutput out: { display_name: "S", composite: 1 };"#),
                   "Expected script function");
    }
}
