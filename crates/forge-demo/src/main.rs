//! # FORGE Demo
//!
//! Runs one tensor operator on the reference device: selects an adapter,
//! uploads the input, initializes and executes the operator, reads the
//! output back and prints both tensors with the elapsed dispatch time.

use std::path::PathBuf;
use std::process;
use std::time::Instant;

use clap::{Parser, Subcommand};

use forge_cmd::CommandChannel;
use forge_core::Result;
use forge_hal::{select_device, AdapterPolicy, Device, HeapKind, ReferencePlatform, ResourceStates};
use forge_mem::{Buffer, ResourcePool};
use forge_ml::{
    ConvolutionDesc, DataType, ExecutionFlags, OperatorDesc, OperatorPipeline, ShaderPass,
    ShaderPassDesc, TensorDesc,
};

// =============================================================================
// COMMAND LINE
// =============================================================================

#[derive(Parser, Debug)]
#[command(author, version, about = "Tensor operator dispatch on the FORGE reference device")]
struct Cli {
    /// Use the hardware adapter whose description contains NAME
    #[arg(long, global = true, value_name = "NAME")]
    adapter: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Identity over a [1, 2, 3, 4] tensor
    Identity {
        /// Fill value of the input tensor
        #[arg(long, default_value_t = 1.618)]
        value: f32,
        /// Execute dispatches to time
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },
    /// 3x2 convolution of a [1, 3, 8, 8] tensor with an all-ones filter
    Convolution {
        /// Fill value of the input tensor
        #[arg(long, default_value_t = 1.0)]
        value: f32,
        /// Evaluate directly instead of through a scratch buffer
        #[arg(long)]
        direct: bool,
    },
    /// Identity over a [2, 3, 4] block through the precompiled shader
    Shader {
        /// Directory holding identity.cso
        #[arg(long, default_value = "kernels")]
        kernel_dir: PathBuf,
        /// Fill value of the input tensor
        #[arg(long, default_value_t = 1.618)]
        value: f32,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        log::error!("{}", e);
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let policy = match &cli.adapter {
        Some(name) => AdapterPolicy::NamedClass(name.clone()),
        None => AdapterPolicy::GraphicsHardware,
    };
    let device = select_device(&ReferencePlatform::new(), &policy)?;
    let mut channel = CommandChannel::new(&device)?;
    let mut pool = ResourcePool::new(&device)?;

    match &cli.command {
        Command::Identity { value, repeat } => {
            run_identity(&device, &mut pool, &mut channel, *value, *repeat)
        }
        Command::Convolution { value, direct } => {
            run_convolution(&device, &mut pool, &mut channel, *value, *direct)
        }
        Command::Shader { kernel_dir, value } => {
            run_shader(&device, &mut pool, &mut channel, kernel_dir.clone(), *value)
        }
    }
}

// =============================================================================
// RUNS
// =============================================================================

fn upload_filled(
    pool: &mut ResourcePool<'_>,
    channel: &mut CommandChannel<'_>,
    size: u64,
    data: &[f32],
) -> Result<Buffer> {
    let buffer = pool.allocate_buffer(size, HeapKind::Default, ResourceStates::COPY_DEST)?;
    pool.upload_f32(channel, buffer, data)?;
    Ok(buffer)
}

fn run_identity<'d>(
    device: &'d Device,
    pool: &mut ResourcePool<'d>,
    channel: &mut CommandChannel<'_>,
    value: f32,
    repeat: u32,
) -> Result<()> {
    let desc = TensorDesc::new(DataType::Float32, &[1, 2, 3, 4])?;
    let count = desc.element_count() as usize;
    let input_data = vec![value; count];

    let input = upload_filled(pool, channel, desc.byte_size(), &input_data)?;
    let output = pool.allocate_buffer(
        desc.byte_size(),
        HeapKind::Default,
        ResourceStates::UNORDERED_ACCESS,
    )?;

    let mut pipeline =
        OperatorPipeline::describe(device, OperatorDesc::identity(desc.clone(), desc.clone()));
    pipeline.compile()?;
    pipeline.initialize(pool, channel, &[])?;
    pool.release_staging()?;

    for _ in 0..repeat.max(1) {
        let start = Instant::now();
        pipeline.execute(pool, channel, &[Some(input)], &[Some(output)])?;
        channel.submit_and_wait()?;
        println!("Dispatch: {:.3} ms", start.elapsed().as_secs_f64() * 1000.0);
    }

    let output_data = pool.readback_f32(channel, output, count)?;
    print_tensor("input", &desc.sizes, &input_data);
    print_tensor("output", &desc.sizes, &output_data);
    pipeline.release(pool)
}

fn run_convolution<'d>(
    device: &'d Device,
    pool: &mut ResourcePool<'d>,
    channel: &mut CommandChannel<'_>,
    value: f32,
    direct: bool,
) -> Result<()> {
    let desc = ConvolutionDesc::new(
        TensorDesc::new(DataType::Float32, &[1, 3, 8, 8])?,
        TensorDesc::new(DataType::Float32, &[1, 3, 3, 2])?,
        TensorDesc::new(DataType::Float32, &[1, 1, 8, 8])?,
    )
    .with_padding([1, 0], [1, 1]);

    let input_data = vec![value; desc.input.element_count() as usize];
    let filter_data = vec![1.0; desc.filter.element_count() as usize];
    let output_count = desc.output.element_count() as usize;

    let input = upload_filled(pool, channel, desc.input.byte_size(), &input_data)?;
    let filter = upload_filled(pool, channel, desc.filter.byte_size(), &filter_data)?;
    let output = pool.allocate_buffer(
        desc.output.byte_size(),
        HeapKind::Default,
        ResourceStates::UNORDERED_ACCESS,
    )?;

    let flags = if direct {
        ExecutionFlags::DISABLE_META_COMMANDS
    } else {
        ExecutionFlags::empty()
    };
    let input_sizes = desc.input.sizes.clone();
    let output_sizes = desc.output.sizes.clone();
    let mut pipeline = OperatorPipeline::describe(device, desc).with_flags(flags);
    let props = pipeline.compile()?.binding_properties();
    log::info!(
        "convolution: {} descriptors, temporary {} B, persistent {} B",
        props.required_descriptor_count,
        props.temporary_resource_size,
        props.persistent_resource_size
    );
    pipeline.initialize(pool, channel, &[])?;
    pool.release_staging()?;

    let start = Instant::now();
    pipeline.execute(
        pool,
        channel,
        &[Some(input), Some(filter), None],
        &[Some(output)],
    )?;
    channel.submit_and_wait()?;
    println!("Dispatch: {:.3} ms", start.elapsed().as_secs_f64() * 1000.0);

    let output_data = pool.readback_f32(channel, output, output_count)?;
    print_tensor("input", &input_sizes, &input_data);
    print_tensor("output", &output_sizes, &output_data);
    pipeline.release(pool)
}

fn run_shader(
    device: &Device,
    pool: &mut ResourcePool<'_>,
    channel: &mut CommandChannel<'_>,
    kernel_dir: PathBuf,
    value: f32,
) -> Result<()> {
    let block = [2, 3, 4];
    let pass = ShaderPass::new(device, ShaderPassDesc::identity(kernel_dir, block))?;
    let count = pass.desc().element_count() as usize;
    let size = (count * 4) as u64;
    let input_data = vec![value; count];

    let input = upload_filled(pool, channel, size, &input_data)?;
    let output = pool.allocate_buffer(size, HeapKind::Default, ResourceStates::UNORDERED_ACCESS)?;

    let start = Instant::now();
    pass.record(pool, channel, input, output)?;
    channel.submit_and_wait()?;
    println!("Dispatch: {:.3} ms", start.elapsed().as_secs_f64() * 1000.0);
    pool.release_staging()?;

    let output_data = pool.readback_f32(channel, output, count)?;
    print_tensor("input", &block, &input_data);
    print_tensor("output", &block, &output_data);
    Ok(())
}

// =============================================================================
// OUTPUT
// =============================================================================

/// Print a row-major tensor, one innermost row per line
fn print_tensor(label: &str, sizes: &[u32], data: &[f32]) {
    println!("{} {:?}:", label, sizes);
    let row = sizes.last().copied().unwrap_or(1).max(1) as usize;
    for chunk in data.chunks(row) {
        let line: Vec<String> = chunk.iter().map(|v| format!("{:8.3}", v)).collect();
        println!("  {}", line.join(" "));
    }
}
