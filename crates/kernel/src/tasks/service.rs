//! The StorPU-side request service.
//!
//! Each compute core's bootstrap thread ends up in [`storpu_service_loop`]:
//! drain the request list, act, yield, sleep until the doorbell. Context
//! lifecycle requests complete inline; an `invoke` spawns a guest thread
//! that carries the task record along, and the scheduler's reap path posts
//! the completion when the entry function returns.

use storpu_abi::errors::Errno;
use storpu_abi::tasks::{StorpuTask, StorpuTaskKind};

use crate::debug::Tasks;
use crate::{arch, scheduler, thread, vm};

use super::{dequeue_storpu_requests, enqueue_storpu_completion};

/// Upper bound we accept for an ELF image laid out in host-shared memory;
/// the real extent comes out of the headers.
const SO_IMAGE_MAX: usize = 64 << 20;

/// Derives the in-memory extent of an ELF image from its header tables.
///
/// # Safety
/// `base` must point at a readable ELF image through the linear mapping.
unsafe fn elf_image_extent(base: *const u8) -> usize {
    // e_shoff/e_shentsize/e_shnum sit at fixed offsets of the ELF64
    // header; the section table is the last thing the tools emit.
    let shoff = unsafe { core::ptr::read_unaligned(base.add(0x28).cast::<u64>()) } as usize;
    let shentsize = unsafe { core::ptr::read_unaligned(base.add(0x3A).cast::<u16>()) } as usize;
    let shnum = unsafe { core::ptr::read_unaligned(base.add(0x3C).cast::<u16>()) } as usize;

    let phoff = unsafe { core::ptr::read_unaligned(base.add(0x20).cast::<u64>()) } as usize;
    let phentsize = unsafe { core::ptr::read_unaligned(base.add(0x36).cast::<u16>()) } as usize;
    let phnum = unsafe { core::ptr::read_unaligned(base.add(0x38).cast::<u16>()) } as usize;

    let mut extent = shoff + shentsize * shnum;
    extent = extent.max(phoff + phentsize * phnum);

    for i in 0..phnum {
        let phdr = unsafe { base.add(phoff + i * phentsize) };
        let p_offset = unsafe { core::ptr::read_unaligned(phdr.add(0x08).cast::<u64>()) } as usize;
        let p_filesz = unsafe { core::ptr::read_unaligned(phdr.add(0x20).cast::<u64>()) } as usize;
        extent = extent.max(p_offset + p_filesz);
    }

    extent.min(SO_IMAGE_MAX)
}

fn create_context(task: &mut StorpuTask) -> Result<(), Errno> {
    let so_addr = unsafe { task.payload.create_context.so_addr };

    let ctx = vm::create_context()?;

    let image = unsafe {
        let base = crate::PhysAddr::from_bits(so_addr as usize)
            .into_virt()
            .into_ptr::<u8>();
        core::slice::from_raw_parts(base, elf_image_extent(base))
    };

    if let Err(err) = vm::exec::vm_exec(&ctx, image) {
        vm::delete_context(&ctx);
        return Err(err);
    }

    task.payload.create_context.cid = ctx.cid();
    Ok(())
}

fn delete_context(task: &mut StorpuTask) -> Result<(), Errno> {
    let cid = unsafe { task.payload.delete_context.cid };

    let ctx = vm::find_get_context(cid).ok_or(Errno::ESRCH)?;
    vm::delete_context(&ctx);
    Ok(())
}

fn invoke(task: *mut StorpuTask) -> Result<(), Errno> {
    let (cid, entry, arg) = unsafe {
        let invoke = &(*task).payload.invoke;
        (invoke.cid, invoke.entry, invoke.arg)
    };

    let ctx = vm::find_get_context(cid).ok_or(Errno::ESRCH)?;

    thread::create(Some(ctx), task, None, entry as usize, arg)?;
    Ok(())
}

/// Dispatches one request. Create/delete answer immediately; a spawned
/// invocation answers when its thread is reaped.
pub fn handle_storpu_request(task: *mut StorpuTask) {
    let kind = unsafe { (*task).kind() };

    let result = match kind {
        Ok(StorpuTaskKind::CreateContext) => create_context(unsafe { &mut *task }),
        Ok(StorpuTaskKind::DeleteContext) => delete_context(unsafe { &mut *task }),
        Ok(StorpuTaskKind::Invoke) => match invoke(task) {
            // The reap path owns the completion now.
            Ok(()) => return,
            Err(err) => Err(err),
        },
        Err(raw) => {
            debug!(Tasks, "dropping request with unknown kind {raw}");
            Err(Errno::EINVAL)
        }
    };

    unsafe {
        (*task).retval = match result {
            Ok(()) => 0,
            Err(err) => err as i32,
        };
    }
    enqueue_storpu_completion(task);
}

/// The compute core's main loop once bring-up is done.
pub fn storpu_service_loop() -> ! {
    loop {
        for task in dequeue_storpu_requests() {
            handle_storpu_request(task);
        }

        scheduler::schedule();
        arch::wait_for_interrupt();
    }
}
