//! End-to-end operator dispatch on the reference device.

use std::fs;

use tempfile::tempdir;

use forge_cmd::CommandChannel;
use forge_core::{CompileError, Error};
use forge_hal::{select_device, AdapterPolicy, Device, HeapKind, ReferencePlatform, ResourceStates};
use forge_mem::{Buffer, ResourcePool};
use forge_ml::{
    BindingTable, BindingTableDesc, CompiledOperator, ConvolutionDesc, ConvolutionMode, DataType,
    DispatchTarget, ExecutionFlags, OperatorDesc, OperatorPipeline, PipelineState, ShaderPass,
    ShaderPassDesc, TensorDesc,
};

fn device() -> Device {
    select_device(&ReferencePlatform::new(), &AdapterPolicy::GraphicsHardware).expect("device")
}

fn tensor(sizes: &[u32]) -> TensorDesc {
    TensorDesc::new(DataType::Float32, sizes).expect("tensor")
}

fn buffer_with(
    pool: &mut ResourcePool<'_>,
    channel: &mut CommandChannel<'_>,
    size: u64,
    data: &[f32],
) -> Buffer {
    let buffer = pool
        .allocate_buffer(size, HeapKind::Default, ResourceStates::COPY_DEST)
        .expect("allocate");
    pool.upload_f32(channel, buffer, data).expect("upload");
    buffer
}

fn output_buffer(pool: &mut ResourcePool<'_>, size: u64) -> Buffer {
    pool.allocate_buffer(size, HeapKind::Default, ResourceStates::UNORDERED_ACCESS)
        .expect("output")
}

// =============================================================================
// IDENTITY
// =============================================================================

#[test]
fn identity_round_trip() {
    let device = device();
    let mut channel = CommandChannel::new(&device).expect("channel");
    let mut pool = ResourcePool::new(&device).expect("pool");

    let desc = tensor(&[1, 2, 3, 4]);
    let size = desc.byte_size();
    assert_eq!(size, 96);

    let data = vec![1.618f32; 24];
    let input = buffer_with(&mut pool, &mut channel, size, &data);
    let output = output_buffer(&mut pool, size);

    let mut pipeline =
        OperatorPipeline::describe(&device, OperatorDesc::identity(desc.clone(), desc));
    pipeline.compile().expect("compile");
    pipeline
        .initialize(&mut pool, &mut channel, &[])
        .expect("initialize");
    pool.release_staging().expect("staging");

    pipeline
        .execute(&mut pool, &mut channel, &[Some(input)], &[Some(output)])
        .expect("execute");
    channel.submit_and_wait().expect("submit");

    let result = pool.readback_f32(&mut channel, output, 24).expect("readback");
    assert_eq!(result, data);
    assert_eq!(pipeline.state(), PipelineState::Executed);
}

#[test]
fn identity_preserves_bit_patterns() {
    let device = device();
    let mut channel = CommandChannel::new(&device).expect("channel");
    let mut pool = ResourcePool::new(&device).expect("pool");

    let patterns = [
        0.0f32,
        -0.0,
        1.618,
        -2.5,
        f32::MIN_POSITIVE / 2.0,
        f32::from_bits(1),
        f32::MAX,
        f32::NEG_INFINITY,
        f32::from_bits(0x7fc0_0001),
        f32::from_bits(0xff80_0001),
    ];
    let shapes: [&[u32]; 4] = [&[1, 2, 3, 4], &[2, 3, 5, 7], &[3, 1, 1, 9], &[5]];

    for sizes in shapes {
        let desc = tensor(sizes);
        let count = desc.element_count() as usize;
        let data: Vec<f32> = patterns.iter().copied().cycle().take(count).collect();
        let input = buffer_with(&mut pool, &mut channel, desc.byte_size(), &data);
        let output = output_buffer(&mut pool, desc.byte_size());

        let mut pipeline =
            OperatorPipeline::describe(&device, OperatorDesc::identity(desc.clone(), desc));
        pipeline.compile().expect("compile");
        pipeline
            .initialize(&mut pool, &mut channel, &[])
            .expect("initialize");
        pool.release_staging().expect("staging");
        pipeline
            .execute(&mut pool, &mut channel, &[Some(input)], &[Some(output)])
            .expect("execute");
        channel.submit_and_wait().expect("submit");

        let result = pool.readback_f32(&mut channel, output, count).expect("readback");
        let expected: Vec<u32> = data.iter().map(|v| v.to_bits()).collect();
        let actual: Vec<u32> = result.iter().map(|v| v.to_bits()).collect();
        assert_eq!(actual, expected, "{:?}", sizes);

        pipeline.release(&mut pool).expect("release pipeline");
        pool.release(input).expect("release input");
        pool.release(output).expect("release output");
    }
    assert_eq!(pool.live_buffers(), 0);
}

#[test]
fn oversized_descriptions_fail_compile() {
    let device = device();
    let huge = tensor(&[65536; 8]);
    let mut identity =
        OperatorPipeline::describe(&device, OperatorDesc::identity(huge.clone(), huge));
    assert_eq!(
        identity.compile().map(|_| ()),
        Err(Error::Compilation(CompileError::TensorTooLarge))
    );
    assert_eq!(identity.state(), PipelineState::Described);

    let conv = || {
        ConvolutionDesc::new(
            tensor(&[1, 1, 4, 4]),
            tensor(&[1, 1, 3, 3]),
            tensor(&[1, 1, 2, 2]),
        )
    };
    let cases = [
        (
            conv().with_padding([u32::MAX, 0], [1, 0]),
            CompileError::InvalidConvolutionParameters,
        ),
        (
            conv().with_dilations([1, u32::MAX]),
            CompileError::InvalidConvolutionWindow,
        ),
    ];
    for (desc, expected) in cases {
        let mut pipeline = OperatorPipeline::describe(&device, desc);
        assert_eq!(
            pipeline.compile().map(|_| ()),
            Err(Error::Compilation(expected))
        );
    }
}

#[test]
fn identity_re_execute_is_stable() {
    let device = device();
    let mut channel = CommandChannel::new(&device).expect("channel");
    let mut pool = ResourcePool::new(&device).expect("pool");

    let desc = tensor(&[2, 5]);
    let data: Vec<f32> = (0..10).map(|i| i as f32 * 0.25).collect();
    let input = buffer_with(&mut pool, &mut channel, desc.byte_size(), &data);
    let output = output_buffer(&mut pool, desc.byte_size());

    let mut pipeline =
        OperatorPipeline::describe(&device, OperatorDesc::identity(desc.clone(), desc));
    pipeline.compile().expect("compile");
    pipeline
        .initialize(&mut pool, &mut channel, &[])
        .expect("initialize");

    let mut runs = Vec::new();
    for _ in 0..2 {
        pipeline
            .execute(&mut pool, &mut channel, &[Some(input)], &[Some(output)])
            .expect("execute");
        channel.submit_and_wait().expect("submit");
        runs.push(pool.readback(&mut channel, output, 40).expect("readback"));
    }
    assert_eq!(runs[0], runs[1]);
    assert_eq!(pipeline.executions(), 2);
}

#[test]
fn identity_strided_input() {
    let device = device();
    let mut channel = CommandChannel::new(&device).expect("channel");
    let mut pool = ResourcePool::new(&device).expect("pool");

    // Column-major [2, 3]
    let input_desc = tensor(&[2, 3]).with_strides(&[1, 2]).expect("strides");
    let output_desc = tensor(&[2, 3]);
    assert_eq!(input_desc.byte_size(), 24);

    let input = buffer_with(
        &mut pool,
        &mut channel,
        24,
        &[0.0, 3.0, 1.0, 4.0, 2.0, 5.0],
    );
    let output = output_buffer(&mut pool, output_desc.byte_size());

    let mut pipeline =
        OperatorPipeline::describe(&device, OperatorDesc::identity(input_desc, output_desc));
    pipeline.compile().expect("compile");
    pipeline
        .initialize(&mut pool, &mut channel, &[])
        .expect("initialize");
    pipeline
        .execute(&mut pool, &mut channel, &[Some(input)], &[Some(output)])
        .expect("execute");
    channel.submit_and_wait().expect("submit");

    let result = pool.readback_f32(&mut channel, output, 6).expect("readback");
    assert_eq!(result, [0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
}

// =============================================================================
// CONVOLUTION
// =============================================================================

fn padded_conv() -> ConvolutionDesc {
    ConvolutionDesc::new(tensor(&[1, 3, 8, 8]), tensor(&[1, 3, 3, 2]), tensor(&[1, 1, 8, 8]))
        .with_padding([1, 0], [1, 1])
}

fn expected_tap_counts() -> Vec<f32> {
    let mut expected = Vec::with_capacity(64);
    for y in 0..8 {
        for x in 0..8 {
            let rows = if y == 0 || y == 7 { 2.0 } else { 3.0 };
            let cols = if x == 7 { 1.0 } else { 2.0 };
            expected.push(3.0 * rows * cols);
        }
    }
    expected
}

fn run_padded_conv(flags: ExecutionFlags) -> (Vec<f32>, bool) {
    let device = device();
    let mut channel = CommandChannel::new(&device).expect("channel");
    let mut pool = ResourcePool::new(&device).expect("pool");

    let desc = padded_conv();
    let input = buffer_with(&mut pool, &mut channel, desc.input.byte_size(), &[1.0; 192]);
    let filter = buffer_with(&mut pool, &mut channel, desc.filter.byte_size(), &[1.0; 18]);
    let output = output_buffer(&mut pool, desc.output.byte_size());

    let mut pipeline = OperatorPipeline::describe(&device, desc).with_flags(flags);
    pipeline.compile().expect("compile");
    pipeline
        .initialize(&mut pool, &mut channel, &[])
        .expect("initialize");
    pool.release_staging().expect("staging");

    pipeline
        .execute(
            &mut pool,
            &mut channel,
            &[Some(input), Some(filter), None],
            &[Some(output)],
        )
        .expect("execute");
    channel.submit_and_wait().expect("submit");

    let result = pool.readback_f32(&mut channel, output, 64).expect("readback");
    (result, pipeline.temporary().is_some())
}

#[test]
fn convolution_counts_padded_taps() {
    let (result, used_scratch) = run_padded_conv(ExecutionFlags::empty());
    assert!(used_scratch);
    let expected = expected_tap_counts();
    assert_eq!(result, expected);
    assert_eq!(result[8 + 3], 18.0);
    assert_eq!(result[3], 12.0);
    assert_eq!(result[8 + 7], 9.0);
    assert_eq!(result[7], 6.0);
    assert_eq!(result[63], 6.0);
}

#[test]
fn convolution_direct_matches_scratch() {
    let (direct, used_scratch) = run_padded_conv(ExecutionFlags::DISABLE_META_COMMANDS);
    assert!(!used_scratch);
    assert_eq!(direct, expected_tap_counts());
}

fn run_row_conv(mode: ConvolutionMode) -> Vec<f32> {
    let device = device();
    let mut channel = CommandChannel::new(&device).expect("channel");
    let mut pool = ResourcePool::new(&device).expect("pool");

    let desc = ConvolutionDesc::new(
        tensor(&[1, 1, 1, 3]),
        tensor(&[1, 1, 1, 2]),
        tensor(&[1, 1, 1, 2]),
    )
    .with_bias(tensor(&[1, 1, 1, 1]))
    .with_mode(mode);
    let input = buffer_with(&mut pool, &mut channel, 12, &[1.0, 2.0, 3.0]);
    let filter = buffer_with(&mut pool, &mut channel, 8, &[10.0, 1.0]);
    let bias = buffer_with(&mut pool, &mut channel, 4, &[0.5]);
    let output = output_buffer(&mut pool, 8);

    let mut pipeline = OperatorPipeline::describe(&device, desc);
    pipeline.compile().expect("compile");
    pipeline
        .initialize(&mut pool, &mut channel, &[])
        .expect("initialize");
    pipeline
        .execute(
            &mut pool,
            &mut channel,
            &[Some(input), Some(filter), Some(bias)],
            &[Some(output)],
        )
        .expect("execute");
    channel.submit_and_wait().expect("submit");
    pool.readback_f32(&mut channel, output, 2).expect("readback")
}

#[test]
fn convolution_mode_flips_filter() {
    assert_eq!(run_row_conv(ConvolutionMode::CrossCorrelation), [12.5, 23.5]);
    assert_eq!(run_row_conv(ConvolutionMode::Convolution), [21.5, 32.5]);
}

#[test]
fn convolution_owned_weights_bound_once() {
    let device = device();
    let mut channel = CommandChannel::new(&device).expect("channel");
    let mut pool = ResourcePool::new(&device).expect("pool");

    let mut desc = padded_conv();
    desc.filter = desc.filter.owned_by_runtime();
    let input = buffer_with(&mut pool, &mut channel, desc.input.byte_size(), &[1.0; 192]);
    let filter = buffer_with(&mut pool, &mut channel, desc.filter.byte_size(), &[1.0; 18]);
    let output = output_buffer(&mut pool, desc.output.byte_size());

    let mut pipeline = OperatorPipeline::describe(&device, desc);
    let props = pipeline.compile().expect("compile").binding_properties();
    assert_eq!(props.persistent_resource_size, 72);
    assert_eq!(props.required_descriptor_count, 6);

    pipeline
        .initialize(&mut pool, &mut channel, &[None, Some(filter), None])
        .expect("initialize");
    assert!(pipeline.persistent().is_some());

    assert_eq!(
        pipeline.execute(
            &mut pool,
            &mut channel,
            &[Some(input), Some(filter), None],
            &[Some(output)],
        ),
        Err(Error::InvalidBinding)
    );

    // The weights buffer is no longer needed once initialized
    pool.release(filter).expect("release filter");
    pipeline
        .execute(&mut pool, &mut channel, &[Some(input), None, None], &[Some(output)])
        .expect("execute");
    channel.submit_and_wait().expect("submit");

    let result = pool.readback_f32(&mut channel, output, 64).expect("readback");
    assert_eq!(result, expected_tap_counts());
}

// =============================================================================
// PROTOCOL ERRORS
// =============================================================================

#[test]
fn execute_before_initialize_is_rejected() {
    let device = device();
    let mut channel = CommandChannel::new(&device).expect("channel");
    let mut pool = ResourcePool::new(&device).expect("pool");
    let desc = tensor(&[4]);
    let input = output_buffer(&mut pool, 16);
    let output = output_buffer(&mut pool, 16);

    let mut pipeline =
        OperatorPipeline::describe(&device, OperatorDesc::identity(desc.clone(), desc));
    pipeline.compile().expect("compile");
    assert_eq!(
        pipeline.execute(&mut pool, &mut channel, &[Some(input)], &[Some(output)]),
        Err(Error::OperatorNotInitialized)
    );
    assert!(channel.list_mut().is_empty());
}

#[test]
fn binding_table_too_small() {
    let device = device();
    let pool = ResourcePool::new(&device).expect("pool");
    let op = CompiledOperator::compile(&padded_conv().into(), ExecutionFlags::empty())
        .expect("compile");

    let range = pool.table_range(0, 4).expect("range");
    let result = BindingTable::new(
        &device,
        &BindingTableDesc {
            target: DispatchTarget::Operator(&op),
            range,
        },
    );
    assert!(matches!(result, Err(Error::BindingTableTooSmall)));
}

#[test]
fn pool_without_room_for_the_table() {
    let device = device();
    let mut channel = CommandChannel::new(&device).expect("channel");
    let mut pool = ResourcePool::new(&device).expect("pool");

    let mut pipeline = OperatorPipeline::describe(&device, padded_conv()).with_descriptor_base(6);
    pipeline.compile().expect("compile");
    assert_eq!(
        pipeline.initialize(&mut pool, &mut channel, &[]),
        Err(Error::DescriptorOutOfRange)
    );
    assert_eq!(pipeline.state(), PipelineState::Compiled);
}

#[test]
fn input_in_wrong_state_is_reported_at_submit() {
    let device = device();
    let mut channel = CommandChannel::new(&device).expect("channel");
    let mut pool = ResourcePool::new(&device).expect("pool");

    let desc = tensor(&[4]);
    // Never transitioned out of COPY_DEST
    let input = pool
        .allocate_buffer(16, HeapKind::Default, ResourceStates::COPY_DEST)
        .expect("input");
    let output = output_buffer(&mut pool, 16);

    let mut pipeline =
        OperatorPipeline::describe(&device, OperatorDesc::identity(desc.clone(), desc));
    pipeline.compile().expect("compile");
    pipeline
        .initialize(&mut pool, &mut channel, &[])
        .expect("initialize");
    pipeline
        .execute(&mut pool, &mut channel, &[Some(input)], &[Some(output)])
        .expect("record");
    assert_eq!(channel.submit_and_wait(), Err(Error::ResourceStateMismatch));
}

// =============================================================================
// SHADER PASS
// =============================================================================

#[test]
fn identity_shader_copies_block() {
    let dir = tempdir().expect("temp dir");
    fs::write(dir.path().join("identity.cso"), b"DXBC").expect("artifact");

    let device = device();
    let mut channel = CommandChannel::new(&device).expect("channel");
    let mut pool = ResourcePool::new(&device).expect("pool");

    let pass =
        ShaderPass::new(&device, ShaderPassDesc::identity(dir.path(), [2, 3, 4])).expect("pass");
    assert_eq!(pass.thread_groups(), [1, 1, 1]);

    let data: Vec<f32> = (0..24).map(|i| i as f32).collect();
    let input = buffer_with(&mut pool, &mut channel, 96, &data);
    let output = output_buffer(&mut pool, 96);
    pass.record(&pool, &mut channel, input, output).expect("record");
    channel.submit_and_wait().expect("submit");

    let result = pool.readback_f32(&mut channel, output, 24).expect("readback");
    assert_eq!(result, data);
}

#[test]
fn missing_shader_artifact() {
    let device = device();
    let dir = tempdir().expect("temp dir");
    let result = ShaderPass::new(&device, ShaderPassDesc::identity(dir.path(), [1, 1, 1]));
    assert!(matches!(result, Err(Error::KernelArtifactUnreadable)));
}
