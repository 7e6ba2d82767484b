// VirtualMachine command implementations
//
// These are the fundamental commands for interacting with the JVM

use crate::commands::{command_sets, vm_commands};
use crate::connection::Connection;
use crate::protocol::{Command, JdwpResult};
use crate::reader::{read_count, read_i32, read_string, read_u64, read_u8};
use crate::suspend::SuspendTarget;
use crate::types::{ReferenceTypeId, ThreadId};
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// JVM version information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmVersion {
    pub description: String,
    pub jdwp_major: i32,
    pub jdwp_minor: i32,
    pub vm_version: String,
    pub vm_name: String,
}

/// ID sizes used by the JVM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmIdSizes {
    pub field_id_size: i32,
    pub method_id_size: i32,
    pub object_id_size: i32,
    pub reference_type_id_size: i32,
    pub frame_id_size: i32,
}

impl VmIdSizes {
    /// Every id is 8 bytes wide, the only layout the engine decodes
    pub fn is_supported(&self) -> bool {
        [
            self.field_id_size,
            self.method_id_size,
            self.object_id_size,
            self.reference_type_id_size,
            self.frame_id_size,
        ]
        .iter()
        .all(|size| *size == 8)
    }
}

/// Class information from ClassesBySignature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassInfo {
    pub ref_type_tag: u8, // 1=class, 2=interface, 3=array
    pub type_id: ReferenceTypeId,
    pub signature: String,
    pub status: i32,
}

fn vm_command(command: u8) -> Command {
    Command::new(command_sets::VIRTUAL_MACHINE, command)
}

impl Connection {
    /// Get JVM version information (VirtualMachine.Version command)
    pub async fn version(&self) -> JdwpResult<VmVersion> {
        let reply = self.send_command(vm_command(vm_commands::VERSION)).await?;
        let mut data = reply.as_slice();

        Ok(VmVersion {
            description: read_string(&mut data)?,
            jdwp_major: read_i32(&mut data)?,
            jdwp_minor: read_i32(&mut data)?,
            vm_version: read_string(&mut data)?,
            vm_name: read_string(&mut data)?,
        })
    }

    /// Get ID sizes (VirtualMachine.IDSizes command)
    pub async fn id_sizes(&self) -> JdwpResult<VmIdSizes> {
        let reply = self.send_command(vm_command(vm_commands::ID_SIZES)).await?;
        let mut data = reply.as_slice();

        Ok(VmIdSizes {
            field_id_size: read_i32(&mut data)?,
            method_id_size: read_i32(&mut data)?,
            object_id_size: read_i32(&mut data)?,
            reference_type_id_size: read_i32(&mut data)?,
            frame_id_size: read_i32(&mut data)?,
        })
    }

    /// Find classes by signature (VirtualMachine.ClassesBySignature command)
    /// Signature format: "Lcom/example/MyClass;" for classes. Results feed
    /// the class-name cache used by class filters.
    pub async fn classes_by_signature(&self, signature: &str) -> JdwpResult<Vec<ClassInfo>> {
        let mut payload = Vec::with_capacity(4 + signature.len());
        payload.put_u32(signature.len() as u32);
        payload.extend_from_slice(signature.as_bytes());

        let reply = self
            .send_command(vm_command(vm_commands::CLASSES_BY_SIGNATURE).with_data(payload))
            .await?;
        let mut data = reply.as_slice();

        let count = read_count(&mut data)?;
        let mut classes = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            classes.push(ClassInfo {
                ref_type_tag: read_u8(&mut data)?,
                type_id: read_u64(&mut data)?,
                signature: signature.to_string(),
                status: read_i32(&mut data)?,
            });
        }

        {
            let mut requests = self.ctx.requests();
            for class in &classes {
                requests.record_class(class.type_id, signature);
            }
        }

        Ok(classes)
    }

    /// Get all live threads (VirtualMachine.AllThreads); each one is
    /// registered with the suspend tracker
    pub async fn all_threads(&self) -> JdwpResult<Vec<ThreadId>> {
        let reply = self.send_command(vm_command(vm_commands::ALL_THREADS)).await?;
        let mut data = reply.as_slice();

        let count = read_count(&mut data)?;
        let mut threads = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let thread = read_u64(&mut data)?;
            self.ctx.threads.register(thread);
            threads.push(thread);
        }

        debug!("Target reports {} threads", threads.len());
        Ok(threads)
    }

    /// Suspend all threads (VirtualMachine.Suspend)
    pub async fn suspend_all(&self) -> JdwpResult<()> {
        self.ctx.threads.suspend(SuspendTarget::All);

        if let Err(e) = self.send_command(vm_command(vm_commands::SUSPEND)).await {
            if !e.is_terminal() {
                if let Err(rollback) = self.ctx.threads.resume(SuspendTarget::All) {
                    debug!("Suspend-all rollback: {}", rollback);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Resume all threads (VirtualMachine.Resume). Fails locally with
    /// `AlreadyRunning` if no all-threads suspend is outstanding.
    pub async fn resume_all(&self) -> JdwpResult<()> {
        self.ctx.threads.resume(SuspendTarget::All)?;

        if let Err(e) = self.send_command(vm_command(vm_commands::RESUME)).await {
            if !e.is_terminal() {
                self.ctx.threads.suspend(SuspendTarget::All);
            }
            return Err(e);
        }
        Ok(())
    }
}
