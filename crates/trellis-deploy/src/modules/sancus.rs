//! Sancus module backend
//!
//! Sources compile with `sancus-cc` (one object per file, in parallel) and
//! link with `sancus-ld`; the number of incident connections is injected into
//! the linker flags when the descriptor does not pin it. Deployment returns
//! the runtime-assigned SM id plus a symbol table; a second `msp430-ld` pass
//! against that table produces the final layout, from which the module key is
//! derived under the node vendor key.

use async_trait::async_trait;
use futures::future::try_join_all;
use object::{Object, ObjectSection, ObjectSymbol};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

use trellis_core::{spongent, Encryption};

use crate::context::{path_str, BuildContext, BuildMode};
use crate::descriptor::{opt_hex_sized, opt_path, opt_u16, str_list};
use crate::error::{Error, Result};
use crate::modules::{ModuleCommon, ModuleOps};
use crate::nodes::{Node, SancusNode};
use crate::rules;
use crate::tools::{self, argv};

const CC: &str = "sancus-cc";
const LD: &str = "sancus-ld";
const LINKER: &str = "msp430-ld";

#[derive(Debug)]
pub struct SancusModule {
    common: ModuleCommon,
    pub files: Vec<PathBuf>,
    pub cflags: Vec<String>,
    pub ldflags: Vec<String>,
    binary: OnceCell<PathBuf>,
    /// (runtime-assigned SM id, symtab linker script)
    deployment: OnceCell<(u16, PathBuf)>,
    key: OnceCell<Vec<u8>>,
}

impl SancusModule {
    pub fn load(map: &serde_json::Map<String, Value>, nodes: &[Arc<Node>]) -> Result<Self> {
        rules::check_module("sancus", map)?;
        let what = "sancus module";

        let common = ModuleCommon::load(map, nodes, what)?;
        if common.node.as_sancus().is_none() {
            return Err(Error::Configuration {
                module_type: "sancus",
                node: common.node.name().to_string(),
                node_type: common.node.ty(),
            });
        }

        let files: Vec<PathBuf> = str_list(map, "files", what)?
            .into_iter()
            .map(crate::descriptor::absolutize)
            .collect();
        if files.is_empty() {
            return Err(Error::descriptor(format!(
                "{what} {}: files must not be empty",
                common.name
            )));
        }

        let id = opt_u16(map, "id", what)?;
        let symtab = opt_path(map, "symtab");
        let deployment = match (id, symtab) {
            (Some(id), Some(symtab)) => Some((id, symtab)),
            _ => None,
        };

        Ok(Self {
            common,
            files,
            cflags: str_list(map, "cflags", what)?,
            ldflags: str_list(map, "ldflags", what)?,
            binary: OnceCell::new_with(opt_path(map, "binary")),
            deployment: OnceCell::new_with(deployment),
            key: OnceCell::new_with(opt_hex_sized(map, "key", spongent::KEY_SIZE, what)?),
        })
    }

    pub fn dump(&self) -> Value {
        let deployed = self.common.deployed();
        json!({
            "type": "sancus",
            "name": self.common.name,
            "node": self.common.node.name(),
            "priority": self.common.priority,
            "deployed": deployed,
            "nonce": self.common.nonce(),
            "attested": self.common.attested(),
            "files": self.files.iter().map(|f| f.display().to_string()).collect::<Vec<_>>(),
            "cflags": self.cflags,
            "ldflags": self.ldflags,
            "binary": deployed.then(|| self.binary.get().map(|b| b.display().to_string())).flatten(),
            "id": deployed.then(|| self.deployment.get().map(|d| d.0)).flatten(),
            "symtab": deployed.then(|| self.deployment.get().map(|d| d.1.display().to_string())).flatten(),
            "key": deployed.then(|| self.key.get().map(hex::encode)).flatten(),
        })
    }

    fn node_sancus(&self) -> Result<&SancusNode> {
        self.common.node.as_sancus().ok_or(Error::Configuration {
            module_type: "sancus",
            node: self.common.node.name().to_string(),
            node_type: self.common.node.ty(),
        })
    }

    async fn symtab(&self, ctx: &BuildContext) -> Result<PathBuf> {
        self.deploy(ctx).await?;
        self.deployment
            .get()
            .map(|(_, symtab)| symtab.clone())
            .ok_or_else(|| Error::preflight(format!("{} has no symtab", self.common.name)))
    }

    async fn compile_and_link(&self, ctx: &BuildContext) -> Result<PathBuf> {
        info!(
            "Building module {} from {}",
            self.common.name,
            self.files
                .iter()
                .map(|f| f.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let dir = ctx.module_dir(&self.common.name)?;
        let mode_flags: &[&str] = match ctx.mode {
            BuildMode::Debug => &["--debug"],
            BuildMode::Release => &[],
        };

        let mut objects = Vec::with_capacity(self.files.len());
        let mut compiles = Vec::with_capacity(self.files.len());
        for (i, file) in self.files.iter().enumerate() {
            let stem = file
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "src".into());
            let object = dir.join(format!("{stem}_{i}.o"));

            let mut args = argv([CC]);
            args.extend(mode_flags.iter().map(|f| f.to_string()));
            args.extend(self.cflags.iter().cloned());
            args.extend([
                "-c".to_string(),
                "-o".to_string(),
                path_str(&object),
                path_str(file),
            ]);

            objects.push(object);
            compiles.push(async move { tools::run(&args).await });
        }
        try_join_all(compiles).await?;

        let binary = dir.join(format!("{}.elf", self.common.name));

        let mut args = argv([LD]);
        args.extend(mode_flags.iter().map(|f| f.to_string()));
        args.push("--inline-arithmetic".into());
        args.extend(self.ldflags.iter().cloned());
        if !self.ldflags.iter().any(|f| f.contains("--num-connections")) {
            args.push("--num-connections".into());
            args.push(self.common.connections().to_string());
        }
        args.extend(["-o".to_string(), path_str(&binary)]);
        args.extend(objects.iter().map(|o| path_str(o)));

        tools::run(&args).await?;
        Ok(binary)
    }

    /// Relink against the deployment symtab to obtain the final layout.
    async fn link(&self, ctx: &BuildContext) -> Result<PathBuf> {
        let symtab = self.symtab(ctx).await?;
        let binary = self.build(ctx).await?;
        let linked = ctx
            .module_dir(&self.common.name)?
            .join(format!("{}-linked.elf", self.common.name));

        // --noinhibit-exec: the linker complains about .bss alignment but
        // still emits the output we need.
        tools::run(&argv([
            LINKER,
            "-T",
            path_str(&symtab).as_str(),
            "-o",
            path_str(&linked).as_str(),
            "--noinhibit-exec",
            path_str(&binary).as_str(),
        ]))
        .await?;
        Ok(linked)
    }

    async fn symbol_value(&self, symbol: &str, ctx: &BuildContext) -> Result<Option<u16>> {
        let binary = self.build(ctx).await?;
        let data = tokio::fs::read(&binary).await?;
        find_symbol_value(&data, symbol)
    }

    async fn io_id(&self, io_name: &str, ctx: &BuildContext) -> Result<u16> {
        let symbol = format!("__sm_{}_io_{}_idx", self.common.name, io_name);
        self.symbol_value(&symbol, ctx)
            .await?
            .ok_or_else(|| Error::NoSuchEndpoint {
                module: self.common.name.clone(),
                endpoint: io_name.to_string(),
            })
    }
}

#[async_trait]
impl ModuleOps for SancusModule {
    fn common(&self) -> &ModuleCommon {
        &self.common
    }

    fn supported_encryption(&self) -> &'static [Encryption] {
        &[Encryption::Spongent]
    }

    async fn build(&self, ctx: &BuildContext) -> Result<PathBuf> {
        self.binary
            .get_or_try_init(|| self.compile_and_link(ctx))
            .await
            .cloned()
    }

    async fn deploy(&self, ctx: &BuildContext) -> Result<()> {
        if self.common.deployed() {
            if self.deployment.get().is_none() {
                return Err(Error::descriptor(format!(
                    "module {} marked deployed but missing id/symtab",
                    self.common.name
                )));
            }
            return Ok(());
        }

        self.deployment
            .get_or_try_init(|| async {
                let binary = self.build(ctx).await?;
                self.node_sancus()?
                    .load_module(&self.common.name, &binary, ctx)
                    .await
            })
            .await?;

        self.common.mark_deployed();
        Ok(())
    }

    async fn attest(&self, ctx: &BuildContext) -> Result<()> {
        if self.common.attested() {
            return Ok(());
        }

        let id = self.get_id(ctx).await?;
        let key = self.key(ctx).await?;
        self.node_sancus()?
            .attest_module(&self.common.name, id, &key)
            .await?;

        self.common.mark_attested();
        Ok(())
    }

    async fn key(&self, ctx: &BuildContext) -> Result<Vec<u8>> {
        self.key
            .get_or_try_init(|| async {
                let linked = self.link(ctx).await?;
                let vendor_key = self.node_sancus()?.vendor_key.clone();

                let data = tokio::fs::read(&linked).await?;
                let section = format!(".text.sm.{}", self.common.name);
                let text = find_section(&data, &section)?.ok_or_else(|| {
                    Error::descriptor(format!(
                        "module {}: section {section} not found in linked binary",
                        self.common.name
                    ))
                })?;

                let key = spongent::mac(&vendor_key, &text)?;
                info!("Module key for {}: {}", self.common.name, hex::encode(&key));
                Ok(key)
            })
            .await
            .cloned()
    }

    async fn get_id(&self, ctx: &BuildContext) -> Result<u16> {
        self.deploy(ctx).await?;
        self.deployment
            .get()
            .map(|(id, _)| *id)
            .ok_or_else(|| Error::preflight(format!("{} has no id", self.common.name)))
    }

    async fn input_id(&self, name: &str, ctx: &BuildContext) -> Result<u16> {
        self.io_id(name, ctx).await
    }

    async fn output_id(&self, name: &str, ctx: &BuildContext) -> Result<u16> {
        self.io_id(name, ctx).await
    }

    async fn entry_id(&self, name: &str, ctx: &BuildContext) -> Result<u16> {
        let symbol = format!("__sm_{}_entry_{}_idx", self.common.name, name);
        self.symbol_value(&symbol, ctx)
            .await?
            .ok_or_else(|| Error::NoSuchEndpoint {
                module: self.common.name.clone(),
                endpoint: name.to_string(),
            })
    }

    async fn request_id(&self, name: &str, ctx: &BuildContext) -> Result<u16> {
        self.io_id(name, ctx).await
    }

    async fn handler_id(&self, name: &str, ctx: &BuildContext) -> Result<u16> {
        self.io_id(name, ctx).await
    }
}

/// Look up a defined symbol's value in an ELF image. Undefined symbols
/// (SHN_UNDEF) are rejected.
pub(crate) fn find_symbol_value(data: &[u8], symbol: &str) -> Result<Option<u16>> {
    let file = object::File::parse(data)
        .map_err(|e| Error::descriptor(format!("failed to parse ELF: {e}")))?;

    for sym in file.symbols() {
        if let Ok(name) = sym.name() {
            if name == symbol && !sym.is_undefined() {
                return Ok(Some(sym.address() as u16));
            }
        }
    }
    Ok(None)
}

/// Extract a named section's bytes from an ELF image.
pub(crate) fn find_section(data: &[u8], section: &str) -> Result<Option<Vec<u8>>> {
    let file = object::File::parse(data)
        .map_err(|e| Error::descriptor(format!("failed to parse ELF: {e}")))?;

    for sec in file.sections() {
        if let Ok(name) = sec.name() {
            if name == section {
                let bytes = sec.data().map_err(|e| {
                    Error::descriptor(format!("failed to read section {section}: {e}"))
                })?;
                return Ok(Some(bytes.to_vec()));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::write::{Object as WriteObject, Symbol, SymbolSection};
    use object::{Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope};

    fn elf_with_symbol(name: &str, value: u64) -> Vec<u8> {
        let mut obj = WriteObject::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value,
            size: 0,
            kind: SymbolKind::Data,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Absolute,
            flags: SymbolFlags::None,
        });
        obj.write().unwrap()
    }

    #[test]
    fn test_symbol_resolution() {
        let elf = elf_with_symbol("__sm_foo_io_sensor_idx", 0x42);
        assert_eq!(
            find_symbol_value(&elf, "__sm_foo_io_sensor_idx").unwrap(),
            Some(0x42)
        );
        assert_eq!(find_symbol_value(&elf, "__sm_foo_io_absent_idx").unwrap(), None);
    }

    #[test]
    fn test_undefined_symbol_rejected() {
        let mut obj =
            WriteObject::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        obj.add_symbol(Symbol {
            name: b"__sm_foo_io_pending_idx".to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Data,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        let elf = obj.write().unwrap();

        assert_eq!(find_symbol_value(&elf, "__sm_foo_io_pending_idx").unwrap(), None);
    }

    #[test]
    fn test_garbage_elf_rejected() {
        assert!(find_symbol_value(b"not an elf", "sym").is_err());
    }
}
