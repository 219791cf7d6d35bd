use std::sync::Arc;

use crate::config::KvpinConfig;
use crate::dispatch::{SingleLayerLayout, TransferDispatcher};
use crate::driver::{AcceleratorDriver, HostMemory};
use crate::error::Result;
use crate::kernel::{Direction, KernelLauncher};
use crate::probe::CapabilityProbe;
use crate::registry::PinnedRegistry;
use crate::selector::RegistrationSelector;
use crate::tensor::{SpliceStorage, TensorBuffer};

/// Entry point for an inference engine: owns the registry and wires the
/// probe, the registration selector and the dispatcher around it.
pub struct KvOffload {
    registry: Arc<PinnedRegistry>,
    probe: Arc<CapabilityProbe>,
    selector: RegistrationSelector,
    dispatcher: TransferDispatcher,
}

impl KvOffload {
    pub fn new(
        config: &KvpinConfig,
        driver: Arc<dyn AcceleratorDriver>,
        host_memory: Arc<dyn HostMemory>,
        launcher: Arc<dyn KernelLauncher>,
    ) -> Self {
        let registry = Arc::new(PinnedRegistry::new(
            Arc::clone(&driver),
            host_memory,
            config.device.visible_devices_env.clone(),
        ));
        let probe = Arc::new(CapabilityProbe::new(driver, config.device.clone()));
        let selector = RegistrationSelector::new(
            Arc::clone(&registry),
            Arc::clone(&probe),
            config.registry.direct_registration_min_major,
        );
        let dispatcher = TransferDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&probe),
            launcher,
            config.dispatch.clone(),
        );
        Self { registry, probe, selector, dispatcher }
    }

    pub fn registry(&self) -> &Arc<PinnedRegistry> {
        &self.registry
    }

    pub fn probe(&self) -> &Arc<CapabilityProbe> {
        &self.probe
    }

    pub fn dispatcher(&self) -> &TransferDispatcher {
        &self.dispatcher
    }

    /// Register a pinned host buffer and return its device address.
    pub fn register_host_memory<B>(&self, buffer: &mut B) -> Result<u64>
    where
        B: SpliceStorage + ?Sized,
    {
        self.selector.acquire_device_pointer(buffer)
    }

    /// Drop the registration of `buffer`. Unknown buffers are ignored.
    pub fn unregister_host_memory<B>(&self, buffer: &B) -> Result<()>
    where
        B: TensorBuffer + ?Sized,
    {
        self.registry.unregister(buffer.data_ptr())
    }

    pub fn resolve_device_pointer(&self, raw: u64) -> Option<u64> {
        self.registry.resolve_device_pointer(raw)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn transfer_multi_layer(
        &self,
        offload: &dyn TensorBuffer,
        layer_ptrs: &dyn TensorBuffer,
        slot_mapping: &dyn TensorBuffer,
        target_device: u32,
        page_size: usize,
        direction: Direction,
        reduced_kv: bool,
    ) -> Result<()> {
        self.dispatcher.transfer_multi_layer(
            offload,
            layer_ptrs,
            slot_mapping,
            target_device,
            page_size,
            direction,
            reduced_kv,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn transfer_multi_layer_bounded(
        &self,
        offload: &dyn TensorBuffer,
        layer_ptrs: &dyn TensorBuffer,
        slot_mapping: &dyn TensorBuffer,
        target_device: u32,
        page_size: usize,
        direction: Direction,
        reduced_kv: bool,
    ) -> Result<()> {
        self.dispatcher.transfer_multi_layer_bounded(
            offload,
            layer_ptrs,
            slot_mapping,
            target_device,
            page_size,
            direction,
            reduced_kv,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn transfer_single_layer(
        &self,
        offload: &dyn TensorBuffer,
        paged_key: &dyn TensorBuffer,
        paged_value: &dyn TensorBuffer,
        slot_mapping: &dyn TensorBuffer,
        direction: Direction,
        token_major: bool,
        two_plane_major: bool,
    ) -> Result<()> {
        self.dispatcher.transfer_single_layer(
            offload,
            paged_key,
            paged_value,
            slot_mapping,
            direction,
            SingleLayerLayout { token_major, two_plane_major },
        )
    }

    pub fn load_and_reshape(
        &self,
        offload: &dyn TensorBuffer,
        key_cache: &dyn TensorBuffer,
        value_cache: &dyn TensorBuffer,
        slot_mapping: &dyn TensorBuffer,
        layer: usize,
    ) -> Result<()> {
        self.dispatcher
            .load_and_reshape(offload, key_cache, value_cache, slot_mapping, layer)
    }

    pub fn store_and_reshape(
        &self,
        offload: &dyn TensorBuffer,
        key_cache: &dyn TensorBuffer,
        value_cache: &dyn TensorBuffer,
        slot_mapping: &dyn TensorBuffer,
        layer: usize,
    ) -> Result<()> {
        self.dispatcher
            .store_and_reshape(offload, key_cache, value_cache, slot_mapping, layer)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn transfer_multi_layer_unilateral(
        &self,
        offload: &dyn TensorBuffer,
        key_ptrs: &dyn TensorBuffer,
        value_ptrs: &dyn TensorBuffer,
        slot_mapping: &dyn TensorBuffer,
        target_device: u32,
        page_size: usize,
        direction: Direction,
    ) -> Result<()> {
        self.dispatcher.transfer_multi_layer_unilateral(
            offload,
            key_ptrs,
            value_ptrs,
            slot_mapping,
            target_device,
            page_size,
            direction,
        )
    }
}
