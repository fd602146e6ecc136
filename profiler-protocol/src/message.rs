use std::collections::HashMap;

use profiler_types::{
    CallRecordDelta, Id, LongAddress, ModuleId, ModuleMapping, ModuleMetadata, PatchState,
    Rva, SourceFile, Symbol, ThreadInfo,
};

use crate::codec::{Reader, Writer};
use crate::error::Error;

/// A message's tag, as laid out in §6: `1 init` through `11 patch_result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tag {
    Init = 1,
    ModulesLoaded = 2,
    ModulesUnloaded = 3,
    RequestModuleMetadata = 4,
    ModuleMetadata = 5,
    RequestStatisticsUpdate = 6,
    StatisticsUpdate = 7,
    ThreadsInfo = 8,
    ApplyPatches = 9,
    RevertPatches = 10,
    PatchResult = 11,
}

impl Tag {
    pub fn from_u32(v: u32) -> Result<Self, Error> {
        Ok(match v {
            1 => Tag::Init,
            2 => Tag::ModulesLoaded,
            3 => Tag::ModulesUnloaded,
            4 => Tag::RequestModuleMetadata,
            5 => Tag::ModuleMetadata,
            6 => Tag::RequestStatisticsUpdate,
            7 => Tag::StatisticsUpdate,
            8 => Tag::ThreadsInfo,
            9 => Tag::ApplyPatches,
            10 => Tag::RevertPatches,
            11 => Tag::PatchResult,
            other => return Err(Error::UnknownTag(other)),
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Correlates a request with its response. Requests/responses carry this as
/// the first field of their payload; fire-and-forget messages don't have one.
pub type Token = u32;

/// One RVA's outcome from an apply/revert cycle, as reported by
/// `patch_result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchOutcome {
    pub rva: Rva,
    pub state: PatchState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Init {
        executable: String,
        ticks_per_second: u64,
    },
    ModulesLoaded {
        mappings: Vec<ModuleMapping>,
    },
    ModulesUnloaded {
        mapping_ids: Vec<Id>,
    },
    RequestModuleMetadata {
        token: Token,
        module_id: ModuleId,
    },
    ModuleMetadata {
        token: Token,
        module_id: ModuleId,
        metadata: Option<ModuleMetadata>,
    },
    RequestStatisticsUpdate {
        token: Token,
    },
    StatisticsUpdate {
        deltas: HashMap<Id, Vec<CallRecordDelta>>,
    },
    ThreadsInfo {
        threads: HashMap<Id, ThreadInfo>,
    },
    ApplyPatches {
        token: Token,
        module_id: ModuleId,
        rvas: Vec<Rva>,
    },
    RevertPatches {
        token: Token,
        module_id: ModuleId,
        rvas: Vec<Rva>,
    },
    PatchResult {
        token: Token,
        module_id: ModuleId,
        outcomes: Vec<PatchOutcome>,
    },
}

impl Message {
    pub fn tag(&self) -> Tag {
        match self {
            Message::Init { .. } => Tag::Init,
            Message::ModulesLoaded { .. } => Tag::ModulesLoaded,
            Message::ModulesUnloaded { .. } => Tag::ModulesUnloaded,
            Message::RequestModuleMetadata { .. } => Tag::RequestModuleMetadata,
            Message::ModuleMetadata { .. } => Tag::ModuleMetadata,
            Message::RequestStatisticsUpdate { .. } => Tag::RequestStatisticsUpdate,
            Message::StatisticsUpdate { .. } => Tag::StatisticsUpdate,
            Message::ThreadsInfo { .. } => Tag::ThreadsInfo,
            Message::ApplyPatches { .. } => Tag::ApplyPatches,
            Message::RevertPatches { .. } => Tag::RevertPatches,
            Message::PatchResult { .. } => Tag::PatchResult,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Message::Init {
                executable,
                ticks_per_second,
            } => {
                w.write_string(executable);
                w.write_u64(*ticks_per_second);
            }
            Message::ModulesLoaded { mappings } => {
                w.write_u32(mappings.len() as u32);
                for m in mappings {
                    write_module_mapping(&mut w, m);
                }
            }
            Message::ModulesUnloaded { mapping_ids } => {
                w.write_u32(mapping_ids.len() as u32);
                for id in mapping_ids {
                    w.write_u64(id.get());
                }
            }
            Message::RequestModuleMetadata { token, module_id } => {
                w.write_u32(*token);
                w.write_u64(module_id.0);
            }
            Message::ModuleMetadata {
                token,
                module_id,
                metadata,
            } => {
                w.write_u32(*token);
                w.write_u64(module_id.0);
                match metadata {
                    Some(m) => {
                        w.write_bool(true);
                        write_module_metadata(&mut w, m);
                    }
                    None => w.write_bool(false),
                }
            }
            Message::RequestStatisticsUpdate { token } => {
                w.write_u32(*token);
            }
            Message::StatisticsUpdate { deltas } => {
                w.write_u32(deltas.len() as u32);
                for (thread_id, records) in deltas {
                    w.write_u64(thread_id.get());
                    w.write_u32(records.len() as u32);
                    for d in records {
                        write_call_record_delta(&mut w, d);
                    }
                }
            }
            Message::ThreadsInfo { threads } => {
                w.write_u32(threads.len() as u32);
                for (id, info) in threads {
                    w.write_u64(id.get());
                    write_thread_info(&mut w, info);
                }
            }
            Message::ApplyPatches {
                token,
                module_id,
                rvas,
            }
            | Message::RevertPatches {
                token,
                module_id,
                rvas,
            } => {
                w.write_u32(*token);
                w.write_u64(module_id.0);
                w.write_u32(rvas.len() as u32);
                for rva in rvas {
                    w.write_u32(*rva);
                }
            }
            Message::PatchResult {
                token,
                module_id,
                outcomes,
            } => {
                w.write_u32(*token);
                w.write_u64(module_id.0);
                w.write_u32(outcomes.len() as u32);
                for outcome in outcomes {
                    w.write_u32(outcome.rva);
                    w.write_u8(patch_state_to_u8(outcome.state));
                }
            }
        }
        w.into_bytes()
    }

    pub fn decode(tag: Tag, payload: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(payload);
        Ok(match tag {
            Tag::Init => Message::Init {
                executable: r.read_string()?,
                ticks_per_second: r.read_u64()?,
            },
            Tag::ModulesLoaded => {
                let count = r.read_u32()?;
                let mut mappings = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    mappings.push(read_module_mapping(&mut r)?);
                }
                Message::ModulesLoaded { mappings }
            }
            Tag::ModulesUnloaded => {
                let count = r.read_u32()?;
                let mut mapping_ids = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    mapping_ids.push(Id::new(r.read_u64()?));
                }
                Message::ModulesUnloaded { mapping_ids }
            }
            Tag::RequestModuleMetadata => Message::RequestModuleMetadata {
                token: r.read_u32()?,
                module_id: ModuleId(r.read_u64()?),
            },
            Tag::ModuleMetadata => {
                let token = r.read_u32()?;
                let module_id = ModuleId(r.read_u64()?);
                let metadata = if r.read_bool()? {
                    Some(read_module_metadata(&mut r)?)
                } else {
                    None
                };
                Message::ModuleMetadata {
                    token,
                    module_id,
                    metadata,
                }
            }
            Tag::RequestStatisticsUpdate => Message::RequestStatisticsUpdate {
                token: r.read_u32()?,
            },
            Tag::StatisticsUpdate => {
                let thread_count = r.read_u32()?;
                let mut deltas = HashMap::with_capacity(thread_count as usize);
                for _ in 0..thread_count {
                    let thread_id = Id::new(r.read_u64()?);
                    let record_count = r.read_u32()?;
                    let mut records = Vec::with_capacity(record_count as usize);
                    for _ in 0..record_count {
                        records.push(read_call_record_delta(&mut r)?);
                    }
                    deltas.insert(thread_id, records);
                }
                Message::StatisticsUpdate { deltas }
            }
            Tag::ThreadsInfo => {
                let count = r.read_u32()?;
                let mut threads = HashMap::with_capacity(count as usize);
                for _ in 0..count {
                    let id = Id::new(r.read_u64()?);
                    threads.insert(id, read_thread_info(&mut r)?);
                }
                Message::ThreadsInfo { threads }
            }
            Tag::ApplyPatches | Tag::RevertPatches => {
                let token = r.read_u32()?;
                let module_id = ModuleId(r.read_u64()?);
                let count = r.read_u32()?;
                let mut rvas = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    rvas.push(r.read_u32()?);
                }
                if tag == Tag::ApplyPatches {
                    Message::ApplyPatches {
                        token,
                        module_id,
                        rvas,
                    }
                } else {
                    Message::RevertPatches {
                        token,
                        module_id,
                        rvas,
                    }
                }
            }
            Tag::PatchResult => {
                let token = r.read_u32()?;
                let module_id = ModuleId(r.read_u64()?);
                let count = r.read_u32()?;
                let mut outcomes = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let rva = r.read_u32()?;
                    let state = patch_state_from_u8(r.read_u8()?)?;
                    outcomes.push(PatchOutcome { rva, state });
                }
                Message::PatchResult {
                    token,
                    module_id,
                    outcomes,
                }
            }
        })
    }
}

fn write_module_mapping(w: &mut Writer, m: &ModuleMapping) {
    w.write_u64(m.id.get());
    w.write_u64(m.module_id.0);
    w.write_u64(m.base_address);
    w.write_string(&m.path);
}

fn read_module_mapping(r: &mut Reader) -> Result<ModuleMapping, Error> {
    Ok(ModuleMapping {
        id: Id::new(r.read_u64()?),
        module_id: ModuleId(r.read_u64()?),
        base_address: r.read_u64()?,
        path: r.read_string()?,
    })
}

fn write_module_metadata(w: &mut Writer, m: &ModuleMetadata) {
    w.write_u64(m.module_id.0);
    w.write_string(&m.file_id);
    w.write_string(&m.path);
    w.write_u32(m.content_hash);
    w.write_u32(m.symbols.len() as u32);
    for s in &m.symbols {
        write_symbol(w, s);
    }
    w.write_u32(m.source_files.len() as u32);
    for f in &m.source_files {
        write_source_file(w, f);
    }
}

fn read_module_metadata(r: &mut Reader) -> Result<ModuleMetadata, Error> {
    let module_id = ModuleId(r.read_u64()?);
    let file_id = r.read_string()?;
    let path = r.read_string()?;
    let content_hash = r.read_u32()?;
    let symbol_count = r.read_u32()?;
    let mut symbols = Vec::with_capacity(symbol_count as usize);
    for _ in 0..symbol_count {
        symbols.push(read_symbol(r)?);
    }
    let file_count = r.read_u32()?;
    let mut source_files = Vec::with_capacity(file_count as usize);
    for _ in 0..file_count {
        source_files.push(read_source_file(r)?);
    }
    Ok(ModuleMetadata {
        module_id,
        file_id,
        path,
        content_hash,
        symbols,
        source_files,
    })
}

fn write_symbol(w: &mut Writer, s: &Symbol) {
    w.write_u64(s.module_id.0);
    w.write_u32(s.rva);
    w.write_u32(s.size);
    w.write_string(&s.name);
    w.write_u32(s.file_id);
    w.write_u32(s.line);
}

fn read_symbol(r: &mut Reader) -> Result<Symbol, Error> {
    Ok(Symbol {
        module_id: ModuleId(r.read_u64()?),
        rva: r.read_u32()?,
        size: r.read_u32()?,
        name: r.read_string()?,
        file_id: r.read_u32()?,
        line: r.read_u32()?,
    })
}

fn write_source_file(w: &mut Writer, f: &SourceFile) {
    w.write_u32(f.id);
    w.write_string(&f.path);
}

fn read_source_file(r: &mut Reader) -> Result<SourceFile, Error> {
    Ok(SourceFile {
        id: r.read_u32()?,
        path: r.read_string()?,
    })
}

fn write_thread_info(w: &mut Writer, t: &ThreadInfo) {
    w.write_u64(t.id.get());
    w.write_u64(t.native_id);
    w.write_string(&t.description);
    w.write_u64(t.start_time);
    w.write_u64(t.cpu_time);
    w.write_bool(t.complete);
}

fn read_thread_info(r: &mut Reader) -> Result<ThreadInfo, Error> {
    Ok(ThreadInfo {
        id: Id::new(r.read_u64()?),
        native_id: r.read_u64()?,
        description: r.read_string()?,
        start_time: r.read_u64()?,
        cpu_time: r.read_u64()?,
        complete: r.read_bool()?,
    })
}

fn write_call_record_delta(w: &mut Writer, d: &CallRecordDelta) {
    w.write_u64(d.thread_id.get());
    w.write_u64(d.parent_id.get());
    w.write_u64(d.address as LongAddress);
    w.write_u64(d.times_called);
    w.write_u64(d.inclusive_time);
    w.write_u64(d.exclusive_time);
    w.write_u32(d.max_reentrance);
    w.write_u64(d.max_call_time);
    match &d.histogram {
        Some(h) => {
            w.write_bool(true);
            w.write_u32(h.buckets().len() as u32);
            for bucket in h.buckets() {
                w.write_u64(*bucket);
            }
        }
        None => w.write_bool(false),
    }
}

fn read_call_record_delta(r: &mut Reader) -> Result<CallRecordDelta, Error> {
    let thread_id = Id::new(r.read_u64()?);
    let parent_id = Id::new(r.read_u64()?);
    let address = r.read_u64()?;
    let times_called = r.read_u64()?;
    let inclusive_time = r.read_u64()?;
    let exclusive_time = r.read_u64()?;
    let max_reentrance = r.read_u32()?;
    let max_call_time = r.read_u64()?;
    let histogram = if r.read_bool()? {
        let bucket_count = r.read_u32()?;
        let mut buckets = Vec::with_capacity(bucket_count as usize);
        for _ in 0..bucket_count {
            buckets.push(r.read_u64()?);
        }
        Some(profiler_types::Histogram::from_raw_buckets(buckets))
    } else {
        None
    };
    Ok(CallRecordDelta {
        thread_id,
        parent_id,
        address,
        times_called,
        inclusive_time,
        exclusive_time,
        max_reentrance,
        max_call_time,
        histogram,
    })
}

fn patch_state_to_u8(state: PatchState) -> u8 {
    match state {
        PatchState::Idle => 0,
        PatchState::RequestedApply => 1,
        PatchState::Active => 2,
        PatchState::RequestedRevert => 3,
        PatchState::Error => 4,
    }
}

fn patch_state_from_u8(v: u8) -> Result<PatchState, Error> {
    Ok(match v {
        0 => PatchState::Idle,
        1 => PatchState::RequestedApply,
        2 => PatchState::Active,
        3 => PatchState::RequestedRevert,
        4 => PatchState::Error,
        other => return Err(Error::UnknownTag(other as u32)),
    })
}
