//! Layout engine backed by a compiled WASM guest.
//!
//! Guest ABI (core module, no imports required):
//!
//! * `memory`: exported linear memory
//! * `alloc(len: i32) -> i32`: returns a buffer of at least `len` bytes
//! * `layout(src_ptr, src_len, opts_ptr, opts_len: i32) -> i64`: lays out the
//!   UTF-8 graph at `src_ptr`; `opts` is the JSON form of [`LayoutOptions`].
//!   Returns `(ptr << 32) | len` of a result buffer whose first byte is a
//!   status (0 = ok) followed by UTF-8 markup, or an error message.
//!
//! A fresh instance is created per render, so a guest never sees state left
//! over from an earlier job. The compiled module is shared.

use anyhow::{Context, Result, bail};
use tracing::debug;
use wasmtime::{Config, Engine, Linker, Memory, Module, Store, TypedFunc};

use super::{LayoutEngine, LayoutError, LayoutOptions};

#[derive(Clone, Debug)]
pub struct WasmLayoutEngine {
    engine: Engine,
    module: Module,
    fuel: Option<u64>,
    location: String,
}

impl WasmLayoutEngine {
    /// Compiles `bytes` (binary or, for tests, WAT text). With `fuel` set,
    /// each render may execute at most that many fuel units.
    pub fn compile(bytes: &[u8], location: &str, fuel: Option<u64>) -> Result<Self> {
        let mut config = Config::new();
        config.consume_fuel(fuel.is_some());
        let engine = Engine::new(&config).context("failed to create wasmtime engine")?;
        let module = Module::new(&engine, bytes)
            .with_context(|| format!("failed to compile layout module from {}", location))?;

        for export in ["memory", "alloc", "layout"] {
            if module.get_export(export).is_none() {
                bail!("layout module from {} does not export `{}`", location, export);
            }
        }
        debug!(%location, "compiled layout module");

        Ok(Self {
            engine,
            module,
            fuel,
            location: location.to_string(),
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    fn call_guest(&self, graph: &str, options: &LayoutOptions) -> Result<Result<String, LayoutError>> {
        let mut store = Store::new(&self.engine, ());
        if let Some(fuel) = self.fuel {
            store.set_fuel(fuel)?;
        }
        let linker: Linker<()> = Linker::new(&self.engine);
        let instance = linker
            .instantiate(&mut store, &self.module)
            .context("failed to instantiate layout module")?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .context("layout module exports no memory")?;
        let alloc = instance.get_typed_func::<i32, i32>(&mut store, "alloc")?;
        let layout = instance.get_typed_func::<(i32, i32, i32, i32), i64>(&mut store, "layout")?;

        let opts = serde_json::to_vec(options)?;
        let (src_ptr, src_len) = write_guest(&mut store, &memory, &alloc, graph.as_bytes())?;
        let (opts_ptr, opts_len) = write_guest(&mut store, &memory, &alloc, &opts)?;

        let packed = layout.call(&mut store, (src_ptr, src_len, opts_ptr, opts_len))? as u64;
        let ptr = (packed >> 32) as usize;
        let len = (packed & 0xffff_ffff) as usize;
        if len == 0 {
            return Ok(Err(LayoutError::InvalidOutput("empty result buffer".into())));
        }

        let mut buf = vec![0u8; len];
        memory
            .read(&store, ptr, &mut buf)
            .context("result buffer lies outside guest memory")?;
        let status = buf[0];
        let payload = match String::from_utf8(buf.split_off(1)) {
            Ok(text) => text,
            Err(_) => return Ok(Err(LayoutError::InvalidOutput("result is not UTF-8".into()))),
        };
        if status == 0 {
            Ok(Ok(payload))
        } else {
            Ok(Err(LayoutError::Engine(payload)))
        }
    }
}

fn write_guest(
    store: &mut Store<()>,
    memory: &Memory,
    alloc: &TypedFunc<i32, i32>,
    bytes: &[u8],
) -> Result<(i32, i32)> {
    let len = i32::try_from(bytes.len()).context("input too large for a 32-bit guest")?;
    let ptr = alloc.call(&mut *store, len)?;
    memory
        .write(&mut *store, ptr as u32 as usize, bytes)
        .context("guest allocation lies outside its memory")?;
    Ok((ptr, len))
}

impl LayoutEngine for WasmLayoutEngine {
    fn name(&self) -> &str {
        "wasm"
    }

    fn render(&self, graph: &str, options: &LayoutOptions) -> Result<String, LayoutError> {
        match self.call_guest(graph, options) {
            Ok(outcome) => outcome,
            // traps, fuel exhaustion and ABI violations
            Err(e) => Err(LayoutError::Engine(format!("{:#}", e))),
        }
    }
}
