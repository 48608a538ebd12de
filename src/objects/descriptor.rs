use std::collections::BTreeSet;
use std::sync::Arc;

use ash::vk;

use crate::device::device::DeviceContext;

/// The set of resource types a pool was provisioned for.
pub type TypeSignature = BTreeSet<vk::DescriptorType>;

#[derive(Debug)]
pub enum DescriptorError {
    Vulkan(vk::Result),
    /// The driver rejected an allocation even though the bookkeeping reported
    /// free capacity. Callers must treat this as fatal.
    Exhausted,
    /// The handle does not refer to a live set of this manager.
    InvalidHandle,
}

impl From<vk::Result> for DescriptorError {
    fn from(result: vk::Result) -> Self {
        DescriptorError::Vulkan(result)
    }
}

/// Index handle for a set resident in one of the manager's pools.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DescriptorSetHandle {
    pool_index: usize,
    slot: usize,
    set: vk::DescriptorSet,
}

impl DescriptorSetHandle {
    pub fn get_set(&self) -> vk::DescriptorSet {
        self.set
    }
}

/// Bookkeeping shared between the native pool and the selection logic.
#[derive(Clone, Debug)]
pub(crate) struct PoolKey {
    layout: vk::DescriptorSetLayout,
    types: TypeSignature,
    capacity: u32,
    used: u32,
}

impl PoolKey {
    pub(crate) fn new(layout: vk::DescriptorSetLayout, types: TypeSignature, capacity: u32) -> Self {
        Self {
            layout,
            types,
            capacity,
            used: 0,
        }
    }

    /// A pool only ever serves requests with the exact layout and type
    /// signature it was created for.
    fn matches(&self, layout: vk::DescriptorSetLayout, types: &TypeSignature) -> bool {
        self.layout == layout && &self.types == types
    }

    fn has_capacity(&self) -> bool {
        self.used < self.capacity
    }
}

/// Returns the index of the first pool that matches the request and still has
/// free capacity.
pub(crate) fn select_pool<'a>(
    pools: impl IntoIterator<Item = &'a PoolKey>,
    layout: vk::DescriptorSetLayout,
    types: &TypeSignature,
) -> Option<usize> {
    pools.into_iter().position(|key| key.matches(layout, types) && key.has_capacity())
}

/// A fixed capacity bin of descriptor sets sharing one layout and one type
/// signature.
pub struct DescriptorPool {
    key: PoolKey,
    pool: vk::DescriptorPool,
    slots: Box<[Option<vk::DescriptorSet>]>,
}

impl DescriptorPool {
    fn new(
        device: &DeviceContext,
        layout: vk::DescriptorSetLayout,
        types: &TypeSignature,
        capacity: u32,
    ) -> Result<Self, DescriptorError> {
        let pool_sizes: Vec<_> = types.iter().map(|ty| {
            vk::DescriptorPoolSize {
                ty: *ty,
                descriptor_count: capacity,
            }
        }).collect();

        let info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(capacity)
            .pool_sizes(pool_sizes.as_slice());

        let pool = unsafe {
            device.vk().create_descriptor_pool(&info, None)
        }?;

        Ok(Self {
            key: PoolKey::new(layout, types.clone(), capacity),
            pool,
            slots: vec![None; capacity as usize].into_boxed_slice(),
        })
    }

    pub fn get_used(&self) -> u32 {
        self.key.used
    }

    pub fn get_capacity(&self) -> u32 {
        self.key.capacity
    }

    fn find_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|slot| slot.is_none())
    }

    fn allocate_set(&mut self, device: &DeviceContext) -> Result<(usize, vk::DescriptorSet), DescriptorError> {
        let slot = match self.find_free_slot() {
            Some(slot) => slot,
            None => return Err(DescriptorError::Exhausted),
        };

        let layouts = [self.key.layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        let sets = unsafe {
            device.vk().allocate_descriptor_sets(&info)
        }.map_err(|err| {
            log::error!("Descriptor set allocation failed despite free bookkeeping: {:?}", err);
            DescriptorError::Exhausted
        })?;

        let set = sets[0];
        self.slots[slot] = Some(set);
        self.key.used += 1;
        Ok((slot, set))
    }

    fn free_slot(&mut self, device: &DeviceContext, slot: usize, set: vk::DescriptorSet) -> Result<(), DescriptorError> {
        match self.slots.get(slot) {
            Some(Some(stored)) if *stored == set => {}
            _ => return Err(DescriptorError::InvalidHandle),
        }

        unsafe {
            device.vk().free_descriptor_sets(self.pool, std::slice::from_ref(&set))
        }?;

        self.slots[slot] = None;
        self.key.used -= 1;
        Ok(())
    }

    fn destroy(&mut self, device: &DeviceContext) {
        unsafe {
            device.vk().destroy_descriptor_pool(self.pool, None);
        }
        self.pool = vk::DescriptorPool::null();
        self.slots.fill(None);
        self.key.used = 0;
    }
}

/// Routes descriptor set requests to a matching pool, creating pools on
/// demand.
///
/// Pools live until [`DescriptorManager::reset`], which is intended for full
/// device teardown rather than per frame churn.
pub struct DescriptorManager {
    device: Arc<DeviceContext>,
    pools: Vec<DescriptorPool>,
    sets_per_pool: u32,
}

impl DescriptorManager {
    /// Default number of sets provisioned per pool.
    pub const DEFAULT_SETS_PER_POOL: u32 = 64;

    pub fn new(device: Arc<DeviceContext>, sets_per_pool: u32) -> Self {
        Self {
            device,
            pools: Vec::new(),
            sets_per_pool,
        }
    }

    pub fn get_pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn get_sets_per_pool(&self) -> u32 {
        self.sets_per_pool
    }

    /// Allocates a descriptor set for the given layout and type signature.
    ///
    /// The first pool with a matching signature and free capacity serves the
    /// request; if none matches a new pool provisioned exactly for
    /// `types` is appended.
    pub fn allocate_sets(
        &mut self,
        layout: vk::DescriptorSetLayout,
        types: &TypeSignature,
    ) -> Result<DescriptorSetHandle, DescriptorError> {
        log::debug!("Allocating descriptor set for layout {:?} with types {:?}", layout, types);

        let pool_index = match select_pool(self.pools.iter().map(|pool| &pool.key), layout, types) {
            Some(index) => index,
            None => {
                log::debug!("No matching pool, creating a new one");
                let pool = DescriptorPool::new(&self.device, layout, types, self.sets_per_pool)?;
                self.pools.push(pool);
                self.pools.len() - 1
            }
        };

        let (slot, set) = self.pools[pool_index].allocate_set(&self.device)?;

        Ok(DescriptorSetHandle {
            pool_index,
            slot,
            set,
        })
    }

    /// Returns the slot to its owning pool's free list.
    pub fn free_set(&mut self, handle: DescriptorSetHandle) -> Result<(), DescriptorError> {
        let pool = self.pools.get_mut(handle.pool_index).ok_or(DescriptorError::InvalidHandle)?;
        pool.free_slot(&self.device, handle.slot, handle.set)
    }

    /// Destroys every pool. Outstanding handles become invalid.
    pub fn reset(&mut self) {
        log::debug!("Resetting descriptor manager with {} pools", self.pools.len());
        for pool in self.pools.iter_mut() {
            pool.destroy(&self.device);
        }
        self.pools.clear();
    }
}

impl Drop for DescriptorManager {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn layout(raw: u64) -> vk::DescriptorSetLayout {
        vk::DescriptorSetLayout::from_raw(raw)
    }

    fn types(list: &[vk::DescriptorType]) -> TypeSignature {
        list.iter().copied().collect()
    }

    /// Mirrors the bookkeeping path of `allocate_sets` without a device.
    fn plan_allocation(
        pools: &mut Vec<PoolKey>,
        layout: vk::DescriptorSetLayout,
        signature: &TypeSignature,
        capacity: u32,
    ) -> usize {
        let index = match select_pool(pools.iter(), layout, signature) {
            Some(index) => index,
            None => {
                pools.push(PoolKey::new(layout, signature.clone(), capacity));
                pools.len() - 1
            }
        };
        pools[index].used += 1;
        assert!(pools[index].used <= pools[index].capacity);
        index
    }

    #[test]
    fn first_matching_pool_wins() {
        let signature = types(&[vk::DescriptorType::UNIFORM_BUFFER]);
        let pools = vec![
            PoolKey::new(layout(1), signature.clone(), 4),
            PoolKey::new(layout(1), signature.clone(), 4),
        ];

        assert_eq!(select_pool(pools.iter(), layout(1), &signature), Some(0));
    }

    #[test]
    fn full_pools_are_skipped() {
        let signature = types(&[vk::DescriptorType::UNIFORM_BUFFER]);
        let mut full = PoolKey::new(layout(1), signature.clone(), 2);
        full.used = 2;
        let pools = vec![
            full,
            PoolKey::new(layout(1), signature.clone(), 2),
        ];

        assert_eq!(select_pool(pools.iter(), layout(1), &signature), Some(1));
    }

    #[test]
    fn signature_mismatch_never_matches() {
        let uniform = types(&[vk::DescriptorType::UNIFORM_BUFFER]);
        let sampler = types(&[vk::DescriptorType::COMBINED_IMAGE_SAMPLER]);
        let pools = vec![PoolKey::new(layout(1), uniform, 4)];

        assert_eq!(select_pool(pools.iter(), layout(1), &sampler), None);
    }

    #[test]
    fn layout_mismatch_never_matches() {
        let signature = types(&[vk::DescriptorType::UNIFORM_BUFFER]);
        let pools = vec![PoolKey::new(layout(1), signature.clone(), 4)];

        assert_eq!(select_pool(pools.iter(), layout(2), &signature), None);
    }

    #[test]
    fn n_requests_produce_ceil_n_over_c_pools() {
        let signature = types(&[vk::DescriptorType::UNIFORM_BUFFER]);
        let capacity = 4u32;
        let requests = 10usize;

        let mut pools = Vec::new();
        for _ in 0..requests {
            plan_allocation(&mut pools, layout(1), &signature, capacity);
        }

        let expected = (requests + capacity as usize - 1) / capacity as usize;
        assert_eq!(pools.len(), expected);
    }

    #[test]
    fn different_signature_creates_new_pool_despite_free_capacity() {
        let uniform = types(&[vk::DescriptorType::UNIFORM_BUFFER]);
        let mixed = types(&[vk::DescriptorType::UNIFORM_BUFFER, vk::DescriptorType::COMBINED_IMAGE_SAMPLER]);
        let capacity = 4u32;

        let mut pools = Vec::new();
        let first = plan_allocation(&mut pools, layout(1), &uniform, capacity);
        let second = plan_allocation(&mut pools, layout(1), &uniform, capacity);
        assert_eq!(first, second);
        assert_eq!(pools.len(), 1);
        assert!(pools[0].has_capacity());

        let third = plan_allocation(&mut pools, layout(1), &mixed, capacity);
        assert_eq!(third, 1);
        assert_eq!(pools.len(), 2);
    }

    #[test]
    fn signature_order_does_not_matter() {
        let a = types(&[vk::DescriptorType::UNIFORM_BUFFER, vk::DescriptorType::COMBINED_IMAGE_SAMPLER]);
        let b = types(&[vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::DescriptorType::UNIFORM_BUFFER]);
        let pools = vec![PoolKey::new(layout(1), a, 4)];

        assert_eq!(select_pool(pools.iter(), layout(1), &b), Some(0));
    }
}
