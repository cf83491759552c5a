//! # Reference Executor
//!
//! Runs recorded commands against device memory on the queue timeline.
//!
//! This is where usage states are enforced: a copy, barrier or dispatch that
//! finds a resource in the wrong state fails the whole submission.

use forge_core::{Error, ResourceId, Result};

use crate::command::{Command, ResourceBarrier};
use crate::kernel::{KernelContext, KernelInvocation};
use crate::resource::{ResourceArena, ResourceStates};

/// Execute one closed command list
pub(crate) fn execute(arena: &mut ResourceArena, commands: &[Command], increment: u32) -> Result<()> {
    for (index, command) in commands.iter().enumerate() {
        let result = match command {
            Command::CopyBufferRegion {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => copy_region(arena, *dst, *dst_offset, *src, *src_offset, *size),
            Command::CopyResource { dst, src } => copy_resource(arena, *dst, *src),
            Command::Barrier(barrier) => apply_barrier(arena, barrier),
            Command::Dispatch(invocation) => dispatch(arena, invocation, increment),
        };
        if let Err(e) = result {
            log::error!("command {} ({:?}) failed: {}", index, command, e);
            return Err(e);
        }
    }
    Ok(())
}

fn copy_region(
    arena: &mut ResourceArena,
    dst: ResourceId,
    dst_offset: u64,
    src: ResourceId,
    src_offset: u64,
    size: u64,
) -> Result<()> {
    let (dst_slot, src_slot) = arena.resource_pair_mut(dst, src)?;
    check_copy_states(dst_slot.state, src_slot.state)?;

    let src_end = src_offset.checked_add(size).ok_or(Error::BufferOverflow)?;
    let dst_end = dst_offset.checked_add(size).ok_or(Error::BufferOverflow)?;
    if src_end > src_slot.desc.size || dst_end > dst_slot.desc.size {
        return Err(Error::BufferOverflow);
    }

    dst_slot.bytes_mut()[dst_offset as usize..dst_end as usize]
        .copy_from_slice(&src_slot.bytes()[src_offset as usize..src_end as usize]);
    Ok(())
}

fn copy_resource(arena: &mut ResourceArena, dst: ResourceId, src: ResourceId) -> Result<()> {
    let (dst_slot, src_slot) = arena.resource_pair_mut(dst, src)?;
    check_copy_states(dst_slot.state, src_slot.state)?;
    if dst_slot.desc.size != src_slot.desc.size {
        return Err(Error::InvalidCommand);
    }
    dst_slot.bytes_mut().copy_from_slice(src_slot.bytes());
    Ok(())
}

fn check_copy_states(dst: ResourceStates, src: ResourceStates) -> Result<()> {
    if dst != ResourceStates::COPY_DEST || !src.contains(ResourceStates::COPY_SOURCE) {
        log::error!("copy with dst in {:?}, src in {:?}", dst, src);
        return Err(Error::ResourceStateMismatch);
    }
    Ok(())
}

fn apply_barrier(arena: &mut ResourceArena, barrier: &ResourceBarrier) -> Result<()> {
    match *barrier {
        ResourceBarrier::Transition {
            resource,
            before,
            after,
        } => {
            let slot = arena.resource_mut(resource)?;
            if slot.heap.required_state().is_some() {
                log::error!("{:?} lives in a {:?} heap and cannot transition", resource, slot.heap);
                return Err(Error::ResourceStateMismatch);
            }
            if slot.state != before {
                log::error!(
                    "{:?} transition from {:?}, but resource is in {:?}",
                    resource,
                    before,
                    slot.state
                );
                return Err(Error::ResourceStateMismatch);
            }
            slot.state = after;
            Ok(())
        }
        // Execution is already serialized on the timeline
        ResourceBarrier::Uav { resource } => match resource {
            Some(id) => arena.resource(id).map(|_| ()),
            None => Ok(()),
        },
    }
}

fn dispatch(arena: &mut ResourceArena, invocation: &KernelInvocation, increment: u32) -> Result<()> {
    if invocation.thread_groups.contains(&0) {
        return Ok(());
    }
    log::trace!(
        "dispatch {} {:?}",
        invocation.kernel.name(),
        invocation.thread_groups
    );
    let mut ctx = KernelContext::new(arena, invocation, increment)?;
    invocation.kernel.execute(&mut ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{HeapKind, ResourceDesc};

    fn buffer(arena: &mut ResourceArena, heap: HeapKind, state: ResourceStates) -> ResourceId {
        arena
            .create_resource(heap, &ResourceDesc::buffer(8), state, u64::MAX)
            .expect("create")
    }

    #[test]
    fn test_copy_requires_states() {
        let mut arena = ResourceArena::default();
        let src = buffer(&mut arena, HeapKind::Upload, ResourceStates::GENERIC_READ);
        let dst = buffer(&mut arena, HeapKind::Default, ResourceStates::UNORDERED_ACCESS);

        let commands = [Command::CopyResource { dst, src }];
        assert_eq!(
            execute(&mut arena, &commands, 32),
            Err(Error::ResourceStateMismatch)
        );
    }

    #[test]
    fn test_copy_then_transition() {
        let mut arena = ResourceArena::default();
        let src = buffer(&mut arena, HeapKind::Upload, ResourceStates::GENERIC_READ);
        let dst = buffer(&mut arena, HeapKind::Default, ResourceStates::COPY_DEST);
        arena
            .resource_mut(src)
            .expect("src")
            .bytes_mut()
            .copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let commands = [
            Command::CopyBufferRegion {
                dst,
                dst_offset: 4,
                src,
                src_offset: 0,
                size: 4,
            },
            Command::Barrier(ResourceBarrier::transition(
                dst,
                ResourceStates::COPY_DEST,
                ResourceStates::UNORDERED_ACCESS,
            )),
        ];
        execute(&mut arena, &commands, 32).expect("execute");

        let slot = arena.resource(dst).expect("dst");
        assert_eq!(slot.bytes(), &[0, 0, 0, 0, 1, 2, 3, 4]);
        assert_eq!(slot.state, ResourceStates::UNORDERED_ACCESS);
    }

    #[test]
    fn test_copy_bounds() {
        let mut arena = ResourceArena::default();
        let src = buffer(&mut arena, HeapKind::Upload, ResourceStates::GENERIC_READ);
        let dst = buffer(&mut arena, HeapKind::Readback, ResourceStates::COPY_DEST);
        let commands = [Command::CopyBufferRegion {
            dst,
            dst_offset: 6,
            src,
            src_offset: 0,
            size: 4,
        }];
        assert_eq!(execute(&mut arena, &commands, 32), Err(Error::BufferOverflow));
    }

    #[test]
    fn test_pinned_heaps_cannot_transition() {
        let mut arena = ResourceArena::default();
        let readback = buffer(&mut arena, HeapKind::Readback, ResourceStates::COPY_DEST);
        let commands = [Command::Barrier(ResourceBarrier::transition(
            readback,
            ResourceStates::COPY_DEST,
            ResourceStates::UNORDERED_ACCESS,
        ))];
        assert_eq!(
            execute(&mut arena, &commands, 32),
            Err(Error::ResourceStateMismatch)
        );
    }

    #[test]
    fn test_stale_before_state() {
        let mut arena = ResourceArena::default();
        let id = buffer(&mut arena, HeapKind::Default, ResourceStates::COMMON);
        let commands = [Command::Barrier(ResourceBarrier::transition(
            id,
            ResourceStates::COPY_DEST,
            ResourceStates::UNORDERED_ACCESS,
        ))];
        assert_eq!(
            execute(&mut arena, &commands, 32),
            Err(Error::ResourceStateMismatch)
        );
    }
}
