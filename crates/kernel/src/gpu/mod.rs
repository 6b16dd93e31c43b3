//! GPU (Vulkan/Metal/DX12 via wgpu) implementation of the backend primitives.
//!
//! `AcceleratorBackend` implements `Backend` with wgpu compute shaders.
//! Every call uploads its operands, dispatches, and blocks on a readback, so
//! host arrays are up to date when the call returns.
//!
//! # Shader families
//! - `elementwise` / `floor` -- fill, multiply, add, floor.
//! - `reduce` -- strided partial arg-min/arg-max, finished on the host.
//! - `pairing` / `pair_ops` -- first-in-pair flags, sum and max per pair.
//! - `gamma` / `coalescence` -- collision counts and the per-pair update.
//! - `bitonic` -- argsort with explicit tie-break over padded slots.
//! - `gather` -- index-driven permutation and zero flags.
//!
//! Templated shaders take their element type (`f64` or `i64`) by textual
//! substitution, one pipeline per family, entry point and element type,
//! cached on first use. Devices must support `SHADER_F64` and `SHADER_INT64`.
//!
//! Random draws are generated on the host from the backend's ChaCha stream.

pub mod buffers;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::array::{Array, BoundedArray, Dtype, Multiplier, Scalar, Storage};
use crate::backend::{scoped_call, Backend, BackendKind, BackendOptions, CallOptions, Primitive};
use crate::backends::{self as cpu, Binary, ScalarTarget};
use crate::coalescence::{CoalescenceStats, FullCoalescence, GammaPolicy};
use crate::error::{Error, Result};
use buffers::{Elem, GpuParams};

const WORKGROUP_SIZE: u32 = 256;

/// Partial results of the strided reduction.
const REDUCE_PARTIALS: usize = 4096;

const PARAMS_WGSL: &str = include_str!("shaders/params.wgsl");

/// Features every accelerator device must expose.
fn required_features() -> wgpu::Features {
    wgpu::Features::SHADER_F64 | wgpu::Features::SHADER_INT64
}

// ---------------------------------------------------------------------------
// Shader families
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Family {
    Elementwise,
    Floor,
    Pairing,
    PairOps,
    Gamma,
    Coalescence,
    Reduce,
    Bitonic,
    Gather,
}

/// Binding kinds, in binding order.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Uniform,
    Read,
    ReadWrite,
}

impl Family {
    fn source(self) -> &'static str {
        match self {
            Family::Elementwise => include_str!("shaders/elementwise.wgsl"),
            Family::Floor => include_str!("shaders/floor.wgsl"),
            Family::Pairing => include_str!("shaders/pairing.wgsl"),
            Family::PairOps => include_str!("shaders/pair_ops.wgsl"),
            Family::Gamma => include_str!("shaders/gamma.wgsl"),
            Family::Coalescence => include_str!("shaders/coalescence.wgsl"),
            Family::Reduce => include_str!("shaders/reduce.wgsl"),
            Family::Bitonic => include_str!("shaders/bitonic.wgsl"),
            Family::Gather => include_str!("shaders/gather.wgsl"),
        }
    }

    fn slots(self) -> &'static [Slot] {
        use Slot::*;
        match self {
            Family::Elementwise => &[Uniform, ReadWrite, Read],
            Family::Floor | Family::Pairing => &[Uniform, ReadWrite],
            Family::PairOps => &[Uniform, Read, Read, ReadWrite],
            Family::Gamma => &[Uniform, Read, Read, Read, ReadWrite],
            Family::Coalescence => &[
                Uniform, Read, Read, ReadWrite, ReadWrite, ReadWrite, ReadWrite, ReadWrite,
            ],
            Family::Reduce => &[Uniform, Read, Read, ReadWrite],
            Family::Bitonic => &[Uniform, Read, Read, ReadWrite, ReadWrite, ReadWrite, ReadWrite],
            Family::Gather => &[Uniform, Read, Read, ReadWrite, ReadWrite],
        }
    }

    /// Shader source with the parameter block and element type substituted.
    fn expand(self, elem: Option<Elem>) -> String {
        let mut src = self.source().replace("//!include params", PARAMS_WGSL);
        if let Some(elem) = elem {
            src = src
                .replace("ELEM_T", elem.wgsl())
                .replace("KEY_T", elem.wgsl())
                .replace("ELEM_ZERO", elem.zero())
                .replace("KEY_ZERO", elem.zero());
        }
        src
    }
}

/// A compiled entry point and the layout its bind groups use.
struct Kernel {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

type KernelKey = (Family, &'static str, Option<Elem>);

// ---------------------------------------------------------------------------
// Device setup
// ---------------------------------------------------------------------------

fn request_adapter() -> Option<wgpu::Adapter> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }))
}

/// Check whether an adapter with 64-bit shader arithmetic is available.
pub fn gpu_available() -> bool {
    request_adapter()
        .map(|adapter| adapter.features().contains(required_features()))
        .unwrap_or(false)
}

/// Backend running the primitives as wgpu compute shaders.
pub struct AcceleratorBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    kernels: Mutex<HashMap<KernelKey, Arc<Kernel>>>,
    rng: Mutex<ChaCha8Rng>,
    call: CallOptions,
    max_workgroups: u32,
}

impl AcceleratorBackend {
    /// Create the backend on the highest-performance adapter.
    ///
    /// Fails with [`Error::BackendUnavailable`] when there is no adapter or it
    /// lacks f64/i64 shader support.
    pub fn new(options: BackendOptions) -> Result<Self> {
        let adapter = request_adapter()
            .ok_or_else(|| Error::BackendUnavailable("no suitable GPU adapter found".into()))?;
        let info = adapter.get_info();
        tracing::info!("GPU adapter: {:?} ({:?})", info.name, info.backend);

        let missing = required_features() - adapter.features();
        if !missing.is_empty() {
            return Err(Error::BackendUnavailable(format!(
                "adapter {} lacks shader features {missing:?}",
                info.name
            )));
        }

        // Large populations need bigger storage bindings than the defaults.
        let adapter_limits = adapter.limits();
        let mut required_limits = wgpu::Limits::default();
        required_limits.max_storage_buffers_per_shader_stage = adapter_limits
            .max_storage_buffers_per_shader_stage
            .max(required_limits.max_storage_buffers_per_shader_stage);
        required_limits.max_storage_buffer_binding_size =
            adapter_limits.max_storage_buffer_binding_size;
        required_limits.max_buffer_size = adapter_limits.max_buffer_size;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("sdm_gpu_device"),
                required_features: required_features(),
                required_limits: required_limits.clone(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| Error::BackendUnavailable(format!("failed to create device: {e}")))?;

        Ok(Self {
            device,
            queue,
            kernels: Mutex::new(HashMap::new()),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(options.seed)),
            call: options.call,
            max_workgroups: required_limits.max_compute_workgroups_per_dimension,
        })
    }

    fn run<T>(&self, primitive: Primitive, f: impl FnOnce() -> Result<T>) -> Result<T> {
        scoped_call(primitive, BackendKind::Accelerator, self.call, f, || {
            self.device.poll(wgpu::Maintain::Wait);
        })
    }

    fn not_implemented(primitive: Primitive, detail: &str) -> Error {
        Error::not_implemented(primitive, BackendKind::Accelerator, detail)
    }

    // ---- Pipelines ----

    fn kernel(&self, family: Family, entry: &'static str, elem: Option<Elem>) -> Arc<Kernel> {
        let mut cache = self.kernels.lock();
        cache
            .entry((family, entry, elem))
            .or_insert_with(|| Arc::new(self.build_kernel(family, entry, elem)))
            .clone()
    }

    fn build_kernel(&self, family: Family, entry: &'static str, elem: Option<Elem>) -> Kernel {
        tracing::debug!(?family, entry, ?elem, "compiling compute pipeline");
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(entry),
            source: wgpu::ShaderSource::Wgsl(family.expand(elem).into()),
        });
        let entries: Vec<wgpu::BindGroupLayoutEntry> = family
            .slots()
            .iter()
            .enumerate()
            .map(|(binding, slot)| match slot {
                Slot::Uniform => bgl_uniform(binding as u32),
                Slot::Read => bgl_storage_ro(binding as u32),
                Slot::ReadWrite => bgl_storage_rw(binding as u32),
            })
            .collect();
        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(entry),
                entries: &entries,
            });
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(entry),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some(entry),
                compilation_options: Default::default(),
                cache: None,
            });
        Kernel { pipeline, layout }
    }

    // ---- Dispatch ----

    fn workgroups(&self, invocations: usize) -> Result<u32> {
        let groups = dispatch_size(invocations, WORKGROUP_SIZE);
        if groups > self.max_workgroups as usize {
            return Err(Error::Device(format!(
                "{invocations} invocations exceed the device dispatch limit"
            )));
        }
        Ok(groups as u32)
    }

    /// Record one dispatch of `kernel` with `params` at binding 0 and
    /// `bindings` from binding 1 on.
    fn encode(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        kernel: &Kernel,
        params: &GpuParams,
        bindings: &[&wgpu::Buffer],
        invocations: usize,
    ) -> Result<()> {
        let groups = self.workgroups(invocations)?;
        if groups == 0 {
            return Ok(());
        }
        let params_buffer = buffers::uniform(&self.device, "params", params);
        let entries: Vec<wgpu::BindGroupEntry> = std::iter::once(&params_buffer)
            .chain(bindings.iter().copied())
            .enumerate()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &kernel.layout,
            entries: &entries,
        });
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: None,
            timestamp_writes: None,
        });
        pass.set_pipeline(&kernel.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(groups, 1, 1);
        Ok(())
    }

    fn dispatch(
        &self,
        kernel: &Kernel,
        params: &GpuParams,
        bindings: &[&wgpu::Buffer],
        invocations: usize,
    ) -> Result<()> {
        let mut encoder = self.encoder();
        self.encode(&mut encoder, kernel, params, bindings, invocations)?;
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn encoder(&self) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None })
    }

    fn read<T: bytemuck::Pod>(&self, buffer: &wgpu::Buffer, len: usize) -> Result<Vec<T>> {
        buffers::read_back(&self.device, &self.queue, buffer, len)
    }

    // ---- Shared primitive bodies ----

    /// Elementwise update of a float buffer; `operand` is one scalar or one
    /// value per element.
    fn elementwise_f64(&self, entry: &'static str, data: &mut [f64], operand: &[f64]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let kernel = self.kernel(Family::Elementwise, entry, Some(Elem::F64));
        let data_buf = buffers::storage(&self.device, "data", data);
        let operand_buf = buffers::storage(&self.device, "operand", operand);
        let params = GpuParams { n: len_u32(data.len())?, ..Default::default() };
        self.dispatch(&kernel, &params, &[&data_buf, &operand_buf], data.len())?;
        data.copy_from_slice(&self.read::<f64>(&data_buf, data.len())?);
        Ok(())
    }

    fn elementwise_i64(&self, entry: &'static str, data: &mut [i64], operand: &[i64]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let kernel = self.kernel(Family::Elementwise, entry, Some(Elem::I64));
        let data_buf = buffers::storage(&self.device, "data", data);
        let operand_buf = buffers::storage(&self.device, "operand", operand);
        let params = GpuParams { n: len_u32(data.len())?, ..Default::default() };
        self.dispatch(&kernel, &params, &[&data_buf, &operand_buf], data.len())?;
        data.copy_from_slice(&self.read::<i64>(&data_buf, data.len())?);
        Ok(())
    }

    fn reduce(&self, primitive: Primitive, data: &Array, index: &BoundedArray) -> Result<Scalar> {
        let active = cpu::check_reduction(primitive, data, index)?;
        let values = cpu::numeric(primitive, data)?;
        let partials = active.len().min(REDUCE_PARTIALS);

        let (data_buf, elem) = buffers::numeric(&self.device, "data", values);
        let index_buf = buffers::index(&self.device, "index", active)?;
        let best_buf = buffers::zeroed(&self.device, "best", 4 * partials as u64);
        let kernel = self.kernel(Family::Reduce, "arg_extreme", Some(elem));
        let params = GpuParams {
            length: len_u32(active.len())?,
            count: partials as u32,
            mode: u32::from(primitive == Primitive::Amax),
            ..Default::default()
        };
        self.dispatch(&kernel, &params, &[&index_buf, &data_buf, &best_buf], partials)?;

        let candidates = self.read::<u32>(&best_buf, partials)?;
        let mut best = candidates[0] as usize;
        for &c in &candidates[1..] {
            let c = c as usize;
            let order = values.cmp(c, best);
            let better = if primitive == Primitive::Amin {
                order.is_lt()
            } else {
                order.is_gt()
            };
            if better {
                best = c;
            }
        }
        Ok(values.scalar(best))
    }

    fn sort_index(&self, primitive: Primitive, data: &Array, index: &mut BoundedArray) -> Result<()> {
        cpu::check_ordering(primitive, data, index)?;
        let values = cpu::numeric(primitive, data)?;
        let length = index.length();
        if length < 2 {
            return Ok(());
        }
        let slots = length.next_power_of_two();

        let (data_buf, elem) = buffers::numeric(&self.device, "data", values);
        let index_buf = buffers::index(&self.device, "index", index.active(primitive)?)?;
        let key_bytes = 8 * slots as u64;
        let keys = buffers::zeroed(&self.device, "keys", key_bytes);
        let ties = buffers::zeroed(&self.device, "ties", 4 * slots as u64);
        let payload = buffers::zeroed(&self.device, "payload", 4 * slots as u64);
        let valid = buffers::zeroed(&self.device, "valid", 4 * slots as u64);
        let bindings = [&index_buf, &data_buf, &keys, &ties, &payload, &valid];

        let base = GpuParams {
            length: len_u32(length)?,
            count: len_u32(slots)?,
            mode: u32::from(primitive == Primitive::StableArgsort),
            ..Default::default()
        };
        let init = self.kernel(Family::Bitonic, "init_slots", Some(elem));
        let step = self.kernel(Family::Bitonic, "bitonic_step", Some(elem));

        let mut encoder = self.encoder();
        self.encode(&mut encoder, &init, &base, &bindings, slots)?;
        let mut k = 2;
        while k <= slots {
            let mut j = k / 2;
            while j > 0 {
                let params = GpuParams {
                    j: j as u32,
                    k: k as u32,
                    ..base
                };
                self.encode(&mut encoder, &step, &params, &bindings, slots)?;
                j /= 2;
            }
            k *= 2;
        }
        self.queue.submit(std::iter::once(encoder.finish()));

        let sorted = self.read::<u32>(&payload, length)?;
        let out = &mut index.array_mut().i64s_mut(primitive)?[..length];
        for (slot, v) in out.iter_mut().zip(sorted) {
            *slot = i64::from(v);
        }
        Ok(())
    }

    fn pair_op(
        &self,
        primitive: Primitive,
        entry: &'static str,
        output: &mut Array,
        values: &Array,
        index: &BoundedArray,
    ) -> Result<()> {
        let active = cpu::check_pair_op(primitive, output, values, index)?;
        let pairs = active.len() / 2;
        if pairs == 0 {
            return Ok(());
        }
        let index_buf = buffers::index(&self.device, "index", active)?;
        let params = GpuParams {
            count: len_u32(pairs)?,
            ..Default::default()
        };
        match cpu::binary(primitive, output, values)? {
            Binary::Float(out, vals) => {
                let kernel = self.kernel(Family::PairOps, entry, Some(Elem::F64));
                let values_buf = buffers::storage(&self.device, "values", &vals);
                let out_buf = buffers::storage(&self.device, "output", out);
                self.dispatch(&kernel, &params, &[&index_buf, &values_buf, &out_buf], pairs)?;
                out.copy_from_slice(&self.read::<f64>(&out_buf, out.len())?);
            }
            Binary::Int(out, vals) => {
                let kernel = self.kernel(Family::PairOps, entry, Some(Elem::I64));
                let values_buf = buffers::storage(&self.device, "values", vals);
                let out_buf = buffers::storage(&self.device, "output", out);
                self.dispatch(&kernel, &params, &[&index_buf, &values_buf, &out_buf], pairs)?;
                out.copy_from_slice(&self.read::<i64>(&out_buf, out.len())?);
            }
        }
        Ok(())
    }

    fn permute<T: bytemuck::Pod>(&self, elem: Elem, values: &mut [T], perm: &[u32]) -> Result<()> {
        let length = perm.len();
        let kernel = self.kernel(Family::Gather, "permute", Some(elem));
        let perm_buf = buffers::storage(&self.device, "perm", perm);
        let source = buffers::storage(&self.device, "source", &values[..length]);
        let data = buffers::zeroed(&self.device, "data", std::mem::size_of_val(&values[..length]) as u64);
        let unused = buffers::zeroed(&self.device, "flags", 4);
        let params = GpuParams {
            length: len_u32(length)?,
            ..Default::default()
        };
        self.dispatch(&kernel, &params, &[&perm_buf, &source, &data, &unused], length)?;
        values[..length].copy_from_slice(&self.read::<T>(&data, length)?);
        Ok(())
    }
}

impl Backend for AcceleratorBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Accelerator
    }

    fn synchronize(&self) {
        self.device.poll(wgpu::Maintain::Wait);
    }

    fn rng_position(&self) -> u128 {
        self.rng.lock().get_word_pos()
    }

    fn seek_rng(&self, position: u128) {
        self.rng.lock().set_word_pos(position);
    }

    fn fill(&self, data: &mut Array, value: Scalar) -> Result<()> {
        let p = Primitive::Fill;
        self.run(p, || match cpu::fill_target(data, value)? {
            ScalarTarget::Float(v, x) => self.elementwise_f64("fill", v, &[x]),
            ScalarTarget::Int(v, x) => self.elementwise_i64("fill", v, &[x]),
            ScalarTarget::Bool(..) => Err(Self::not_implemented(p, "bool buffers")),
        })
    }

    fn multiply(&self, data: &mut Array, multiplier: Multiplier<'_>) -> Result<()> {
        let p = Primitive::Multiply;
        self.run(p, || {
            cpu::check_multiply(data, &multiplier)?;
            match multiplier {
                Multiplier::Scalar(s) => match cpu::scalar_multiply(data, s)? {
                    ScalarTarget::Float(v, x) => self.elementwise_f64("multiply_scalar", v, &[x]),
                    ScalarTarget::Int(v, x) => self.elementwise_i64("multiply_scalar", v, &[x]),
                    ScalarTarget::Bool(..) => Err(Error::dtype(p, Dtype::Bool)),
                },
                Multiplier::Elementwise(other) => match cpu::binary(p, data, other)? {
                    Binary::Float(v, o) => self.elementwise_f64("multiply", v, &o),
                    Binary::Int(v, o) => self.elementwise_i64("multiply", v, o),
                },
            }
        })
    }

    fn add(&self, data: &mut Array, other: &Array) -> Result<()> {
        let p = Primitive::Add;
        self.run(p, || {
            cpu::check_add(data, other)?;
            match cpu::binary(p, data, other)? {
                Binary::Float(v, o) => self.elementwise_f64("add", v, &o),
                Binary::Int(v, o) => self.elementwise_i64("add", v, o),
            }
        })
    }

    fn floor(&self, data: &mut Array) -> Result<()> {
        self.run(Primitive::Floor, || {
            cpu::check_floor(data)?;
            let Storage::Float(v) = data.storage_mut() else {
                return Ok(());
            };
            if v.is_empty() {
                return Ok(());
            }
            let kernel = self.kernel(Family::Floor, "floor_values", None);
            let buf = buffers::storage(&self.device, "data", v);
            let params = GpuParams {
                n: len_u32(v.len())?,
                ..Default::default()
            };
            self.dispatch(&kernel, &params, &[&buf], v.len())?;
            v.copy_from_slice(&self.read::<f64>(&buf, v.len())?);
            Ok(())
        })
    }

    fn urand(&self, data: &mut Array) -> Result<()> {
        self.run(Primitive::Urand, || {
            let v = data.f64s_mut(Primitive::Urand)?;
            let mut rng = self.rng.lock();
            v.iter_mut().for_each(|e| *e = rng.gen());
            Ok(())
        })
    }

    fn amin(&self, data: &Array, index: &BoundedArray) -> Result<Scalar> {
        self.run(Primitive::Amin, || self.reduce(Primitive::Amin, data, index))
    }

    fn amax(&self, data: &Array, index: &BoundedArray) -> Result<Scalar> {
        self.run(Primitive::Amax, || self.reduce(Primitive::Amax, data, index))
    }

    fn shuffle(&self, data: &mut BoundedArray, axis: usize) -> Result<()> {
        let p = Primitive::Shuffle;
        self.run(p, || {
            cpu::check_shuffle(data, axis)?;
            if data.array().ndim() != 1 {
                return Err(Self::not_implemented(p, "2-D buffers"));
            }
            let length = data.length();
            if data.array().dtype() == Dtype::Bool {
                return Err(Self::not_implemented(p, "bool buffers"));
            }
            if length < 2 {
                return Ok(());
            }

            let mut perm: Vec<u32> = (0..len_u32(length)?).collect();
            {
                let mut rng = self.rng.lock();
                for i in (1..length).rev() {
                    let j = rng.gen_range(0..=i);
                    perm.swap(i, j);
                }
            }
            match data.array_mut().storage_mut() {
                Storage::Float(v) => self.permute(Elem::F64, v, &perm),
                Storage::Int(v) => self.permute(Elem::I64, v, &perm),
                Storage::Bool(_) => Err(Self::not_implemented(p, "bool buffers")),
            }
        })
    }

    fn argsort(&self, data: &Array, index: &mut BoundedArray) -> Result<()> {
        self.run(Primitive::Argsort, || {
            self.sort_index(Primitive::Argsort, data, index)
        })
    }

    fn stable_argsort(&self, data: &Array, index: &mut BoundedArray) -> Result<()> {
        self.run(Primitive::StableArgsort, || {
            self.sort_index(Primitive::StableArgsort, data, index)
        })
    }

    fn remove_zeros(&self, data: &Array, index: &mut BoundedArray) -> Result<usize> {
        let p = Primitive::RemoveZeros;
        self.run(p, || {
            cpu::check_ordering(p, data, index)?;
            let values = cpu::numeric(p, data)?;
            let length = index.length();
            if length == 0 {
                return Ok(0);
            }

            let (source, elem) = buffers::numeric(&self.device, "data", values);
            let index_buf = buffers::index(&self.device, "index", index.active(p)?)?;
            let unused = buffers::zeroed(&self.device, "data_out", 8);
            let flags = buffers::zeroed(&self.device, "flags", 4 * length as u64);
            let kernel = self.kernel(Family::Gather, "zero_flags", Some(elem));
            let params = GpuParams {
                length: len_u32(length)?,
                ..Default::default()
            };
            self.dispatch(&kernel, &params, &[&index_buf, &source, &unused, &flags], length)?;
            let zero = self.read::<u32>(&flags, length)?;

            // Stable partition on the host from the device flags.
            let idx = &mut index.array_mut().i64s_mut(p)?[..length];
            let (kept, zeros): (Vec<i64>, Vec<i64>) = idx
                .iter()
                .zip(&zero)
                .map(|(&v, &z)| (v, z))
                .fold((Vec::new(), Vec::new()), |(mut kept, mut zeros), (v, z)| {
                    if z == 0 {
                        kept.push(v);
                    } else {
                        zeros.push(v);
                    }
                    (kept, zeros)
                });
            let new_length = kept.len();
            idx[..new_length].copy_from_slice(&kept);
            idx[new_length..].copy_from_slice(&zeros);
            index.set_length(new_length)?;
            Ok(new_length)
        })
    }

    fn is_first_in_pair(&self, output: &mut Array, index: &BoundedArray) -> Result<()> {
        let p = Primitive::IsFirstInPair;
        self.run(p, || {
            cpu::check_first_in_pair(output, index)?;
            let length = index.length();
            if length == 0 {
                return Ok(());
            }
            let flags = buffers::zeroed(&self.device, "flags", 4 * length as u64);
            let kernel = self.kernel(Family::Pairing, "first_in_pair", None);
            let params = GpuParams {
                length: len_u32(length)?,
                ..Default::default()
            };
            self.dispatch(&kernel, &params, &[&flags], length)?;
            let values = self.read::<u32>(&flags, length)?;
            for (o, f) in output.bools_mut(p)?[..length].iter_mut().zip(values) {
                *o = f != 0;
            }
            Ok(())
        })
    }

    fn sum_pair(&self, output: &mut Array, values: &Array, index: &BoundedArray) -> Result<()> {
        self.run(Primitive::SumPair, || {
            self.pair_op(Primitive::SumPair, "sum_pair", output, values, index)
        })
    }

    fn max_pair(&self, output: &mut Array, values: &Array, index: &BoundedArray) -> Result<()> {
        self.run(Primitive::MaxPair, || {
            self.pair_op(Primitive::MaxPair, "max_pair", output, values, index)
        })
    }

    fn compute_gamma(
        &self,
        gamma: &mut Array,
        probability: &Array,
        rand: &Array,
        index: &BoundedArray,
        policy: GammaPolicy,
    ) -> Result<()> {
        let p = Primitive::ComputeGamma;
        self.run(p, || {
            let inputs = cpu::check_gamma(gamma, probability, rand, index)?;
            let pairs = inputs.pairs;
            if pairs == 0 {
                return Ok(());
            }
            let index_buf = buffers::index(&self.device, "index", inputs.active)?;
            let prob_buf = buffers::storage(&self.device, "probability", inputs.probability);
            let rand_buf = buffers::storage(&self.device, "rand", &inputs.rand[..pairs]);
            let gamma_buf = buffers::zeroed(&self.device, "gamma", 8 * pairs as u64);
            let kernel = self.kernel(Family::Gamma, "compute_gamma", None);
            let params = GpuParams {
                count: len_u32(pairs)?,
                mode: match policy {
                    GammaPolicy::StochasticRound => 0,
                    GammaPolicy::Floor => 1,
                    GammaPolicy::Scaled => 2,
                },
                ..Default::default()
            };
            self.dispatch(
                &kernel,
                &params,
                &[&index_buf, &prob_buf, &rand_buf, &gamma_buf],
                pairs,
            )?;
            let values = self.read::<f64>(&gamma_buf, pairs)?;
            gamma.f64s_mut(p)?[..pairs].copy_from_slice(&values);
            Ok(())
        })
    }

    fn coalescence(
        &self,
        multiplicity: &mut Array,
        extensive: &mut [Array],
        gamma: &Array,
        index: &BoundedArray,
        policy: FullCoalescence,
    ) -> Result<CoalescenceStats> {
        let p = Primitive::Coalescence;
        self.run(p, || {
            let inputs = cpu::check_coalescence(multiplicity, extensive, gamma, index)?;
            let pairs = inputs.pairs;
            if pairs == 0 {
                return Ok(CoalescenceStats::new(0));
            }
            let n = multiplicity.len();
            let rows = extensive.len();
            let mut attrs = Vec::with_capacity(rows * n);
            for attr in extensive.iter() {
                attrs.extend_from_slice(attr.f64s(p)?);
            }
            len_u32(rows * n)?;

            let index_buf = buffers::index(&self.device, "index", inputs.active)?;
            let gamma_buf = buffers::storage(&self.device, "gamma", &inputs.gamma[..pairs]);
            let mult_buf = buffers::storage(&self.device, "multiplicity", multiplicity.i64s(p)?);
            let attrs_buf = buffers::storage(&self.device, "attrs", &attrs);
            let events_buf = buffers::zeroed(&self.device, "events", 8 * pairs as u64);
            let died_buf = buffers::zeroed(&self.device, "died", 4 * pairs as u64);
            let status_buf = buffers::storage(&self.device, "status", &[u32::MAX]);
            let kernel = self.kernel(Family::Coalescence, "coalesce", None);
            let params = GpuParams {
                n: len_u32(n)?,
                count: len_u32(pairs)?,
                rows: rows as u32,
                mode: u32::from(policy == FullCoalescence::Split),
                ..Default::default()
            };
            self.dispatch(
                &kernel,
                &params,
                &[&index_buf, &gamma_buf, &mult_buf, &attrs_buf, &events_buf, &died_buf, &status_buf],
                pairs,
            )?;

            let status = self.read::<u32>(&status_buf, 1)?[0];
            if status != u32::MAX {
                // Re-plan the failing pair on the host for a precise diagnostic.
                let k = status as usize;
                let (a, b) = (inputs.active[2 * k] as usize, inputs.active[2 * k + 1] as usize);
                cpu::plan_pair(k, a, b, multiplicity.i64s(p)?, inputs.gamma[k], policy)?;
                return Err(Error::Device(format!("pair {k} rejected by the device update")));
            }

            let events = self.read::<i64>(&events_buf, pairs)?;
            let died = self.read::<u32>(&died_buf, pairs)?;
            let new_mult = self.read::<i64>(&mult_buf, n)?;
            let new_attrs = self.read::<f64>(&attrs_buf, rows * n)?;

            multiplicity.i64s_mut(p)?.copy_from_slice(&new_mult);
            for (attr, values) in extensive.iter_mut().zip(new_attrs.chunks_exact(n.max(1))) {
                attr.f64s_mut(p)?.copy_from_slice(values);
            }
            let mut stats = CoalescenceStats::new(pairs);
            for (&g, &d) in events.iter().zip(&died) {
                if g > 0 {
                    stats.record(g, d != 0);
                }
            }
            Ok(stats)
        })
    }
}

fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::Device(format!("length {len} exceeds u32 range")))
}

/// Calculate dispatch workgroup count: ceil(total / workgroup_size).
fn dispatch_size(total: usize, workgroup_size: u32) -> usize {
    total.div_ceil(workgroup_size as usize)
}

// ---- Bind group layout entry helpers ----

fn bgl_uniform(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn bgl_storage_ro(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn bgl_storage_rw(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}
