use clap::{Parser, Subcommand, ValueEnum};
use kvpin_core::config::{default_config_path, KvpinConfig};
use kvpin_core::layout::{self, SingleLayerGeometry};
use kvpin_core::selector::select_strategy;
use kvpin_core::{CapabilityProbe, DType};
use kvpin_driver::AscendDriver;
use tracing::info;

#[derive(Parser)]
#[command(name = "kvpin")]
#[command(about = "kvpin - pinned host memory and KV cache transfer tooling for Ascend accelerators")]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults to /etc/kvpin/kvpin.toml, then ./kvpin.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Query the installed driver and the active device
    Probe {
        /// Physical device to report PCIe and NUMA information for
        /// (defaults to the active device)
        #[arg(short, long)]
        device: Option<u32>,
    },

    /// Compute the launch plan of a single-layer transfer without hardware
    Plan {
        /// Number of tokens in the slot mapping
        #[arg(short, long)]
        tokens: usize,

        /// Attention heads per token
        #[arg(long)]
        heads: usize,

        /// Elements per head
        #[arg(long)]
        head_dim: usize,

        /// Paged cache blocks
        #[arg(long, default_value_t = 1)]
        blocks: usize,

        /// Slots per paged cache block
        #[arg(long, default_value_t = 128)]
        block_size: usize,

        /// Cache element type
        #[arg(long, value_enum, default_value_t = CacheDType::F16)]
        dtype: CacheDType,

        /// Offload buffer is [tokens, 2, hidden] instead of [2, tokens, hidden]
        #[arg(long)]
        token_major: bool,

        /// Paged cache is [2, blocks, ...] instead of [blocks, 2, ...]
        #[arg(long)]
        two_plane_major: bool,

        /// Override the scratch budget from the config
        #[arg(long)]
        scratch_bytes: Option<u64>,

        /// Override the vector core count from the config
        #[arg(long)]
        cores: Option<u32>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CacheDType {
    F32,
    F16,
    Bf16,
    I64,
    I32,
}

impl From<CacheDType> for DType {
    fn from(d: CacheDType) -> Self {
        match d {
            CacheDType::F32 => DType::F32,
            CacheDType::F16 => DType::F16,
            CacheDType::Bf16 => DType::BF16,
            CacheDType::I64 => DType::I64,
            CacheDType::I32 => DType::I32,
        }
    }
}

fn main() -> anyhow::Result<()> {
    kvpin_common::init_logging();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = KvpinConfig::load_or_default(&config_path);

    match cli.command {
        Commands::Probe { device } => probe(&config, device),
        Commands::Plan {
            tokens,
            heads,
            head_dim,
            blocks,
            block_size,
            dtype,
            token_major,
            two_plane_major,
            scratch_bytes,
            cores,
        } => {
            let geometry = SingleLayerGeometry {
                tokens,
                planes: 2,
                heads,
                head_dim,
                element_size: DType::from(dtype).element_size(),
            };
            let budget = scratch_bytes.unwrap_or(config.device.scratch_bytes);
            let cores = cores.unwrap_or(config.device.vector_cores);
            let plan = layout::plan_single_layer(
                &geometry,
                budget,
                cores,
                config.dispatch.single_layer_max_width,
            )?;
            let hidden = layout::checked_product("hidden size", &[heads as u64, head_dim as u64])?;
            let offload = layout::offload_strides(tokens, hidden as usize, token_major)?;
            let paged = layout::paged_strides(blocks, block_size, heads, head_dim, two_plane_major)?;

            println!("Single-layer transfer plan:");
            println!("  per-token scratch:    {} bytes (budget {})", plan.per_token_bytes, budget);
            println!("  tokens per chunk:     {}", plan.tokens_per_chunk);
            println!("  launch width:         {} core(s)", plan.width);
            println!("  offload token stride: {}", offload.token_stride);
            println!("  offload value offset: {}", offload.value_offset);
            println!("  paged block stride:   {}", paged.block_stride);
            println!("  paged value offset:   {}", paged.value_offset);
            Ok(())
        }
    }
}

fn probe(config: &KvpinConfig, device: Option<u32>) -> anyhow::Result<()> {
    let driver = AscendDriver::load(&config.driver)?;
    let soc_name = driver.soc_name();
    let probe = CapabilityProbe::new(driver, config.device.clone());

    let ordinal = probe.current_device()?;
    let local = probe.resolve_local_device_index()?;
    let version = probe.driver_version()?;
    let strategy = select_strategy(&version, config.registry.direct_registration_min_major);
    info!("probed device {} (physical {})", ordinal, local);

    println!("Platform:           {}", kvpin_common::platform::platform_name());
    println!("SoC:                {}", soc_name.as_deref().unwrap_or("unknown"));
    println!("Driver version:     {}", version);
    println!("Host registration:  {:?}", strategy);
    println!("Device ordinal:     {}", ordinal);
    println!("Physical device:    {}", local);
    println!("Scratch budget:     {} bytes", probe.on_chip_scratch_budget()?);
    println!("Vector cores:       {}", probe.vector_core_count()?);

    let target = device.unwrap_or(local);
    match probe.pci_bus_id(target) {
        Ok(bus_id) => println!("PCIe bus id:        {}", bus_id),
        Err(e) => println!("PCIe bus id:        unavailable ({})", e),
    }
    match probe.numa_node(target) {
        Some(node) => println!("NUMA node:          {}", node),
        None => println!("NUMA node:          none"),
    }
    Ok(())
}

