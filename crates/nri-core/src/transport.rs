//! Plugin transports (C2).
//!
//! A [`PluginTransport`] is how the orchestrator reaches one plugin's
//! ttrpc `Plugin` service, regardless of how that plugin is hosted:
//! spawned external process, pre-connected external process, in-process
//! builtin, or (feature `wasm`) a sandboxed wasm module.

use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};

use crate::api;
use crate::api_ttrpc::PluginClient;
use crate::error::{Error, Result};
use crate::mux::{self, Mux};

const PLUGIN_SOCKET_FD: RawFd = 3;

/// Every ttrpc call the orchestrator can make against a plugin. One
/// implementation per hosting mode; the orchestrator only ever holds a
/// `Box<dyn PluginTransport>`.
#[async_trait]
pub trait PluginTransport: Send + Sync {
    async fn configure(&self, req: api::ConfigureRequest) -> Result<api::ConfigureResponse>;
    async fn synchronize(&self, req: api::SynchronizeRequest) -> Result<api::SynchronizeResponse>;
    async fn shutdown(&self, req: api::ShutdownRequest) -> Result<api::Empty>;

    async fn create_container(&self, req: api::CreateContainerRequest) -> Result<api::CreateContainerResponse>;
    async fn post_create_container(&self, req: api::PostCreateContainerRequest) -> Result<api::PostCreateContainerResponse>;
    async fn start_container(&self, req: api::StartContainerRequest) -> Result<api::StartContainerResponse>;
    async fn post_start_container(&self, req: api::PostStartContainerRequest) -> Result<api::PostStartContainerResponse>;
    async fn update_container(&self, req: api::UpdateContainerRequest) -> Result<api::UpdateContainerResponse>;
    async fn post_update_container(&self, req: api::PostUpdateContainerRequest) -> Result<api::PostUpdateContainerResponse>;
    async fn stop_container(&self, req: api::StopContainerRequest) -> Result<api::StopContainerResponse>;
    async fn remove_container(&self, req: api::RemoveContainerRequest) -> Result<api::RemoveContainerResponse>;

    async fn run_pod_sandbox(&self, req: api::RunPodSandboxRequest) -> Result<api::RunPodSandboxResponse>;
    async fn stop_pod_sandbox(&self, req: api::StopPodSandboxRequest) -> Result<api::StopPodSandboxResponse>;
    async fn remove_pod_sandbox(&self, req: api::RemovePodSandboxRequest) -> Result<api::RemovePodSandboxResponse>;
    async fn update_pod_sandbox(&self, req: api::UpdatePodSandboxRequest) -> Result<api::UpdatePodSandboxResponse>;
    async fn post_update_pod_sandbox(&self, req: api::PostUpdatePodSandboxRequest) -> Result<api::PostUpdatePodSandboxResponse>;

    async fn validate_container_adjustment(
        &self,
        req: api::ValidateContainerAdjustmentRequest,
    ) -> Result<api::ValidateContainerAdjustmentResponse>;

    /// Tears down the transport itself (kills the process, closes the
    /// mux trunk, drops the wasm instance). Distinct from the ttrpc
    /// `Shutdown` call, which asks the plugin to exit gracefully first.
    async fn close(&self);
}

/// Wraps a ttrpc client bound to one mux'd connection, dispatching each
/// trait method to the generated stub. Shared by every transport that
/// talks ttrpc (external, pre-connected, builtin-over-loopback).
struct TtrpcBackedTransport {
    client: PluginClient,
    mux: Arc<Mux>,
    child: Option<tokio::sync::Mutex<Option<Child>>>,
}

macro_rules! ttrpc_call {
    ($self:ident, $method:ident, $req:expr) => {
        $self
            .client
            .$method(default_ctx(), &$req)
            .await
            .map_err(Error::from)
    };
}

fn default_ctx() -> ttrpc::context::Context {
    ttrpc::context::Context::default()
}

#[async_trait]
impl PluginTransport for TtrpcBackedTransport {
    async fn configure(&self, req: api::ConfigureRequest) -> Result<api::ConfigureResponse> {
        ttrpc_call!(self, configure, req)
    }
    async fn synchronize(&self, req: api::SynchronizeRequest) -> Result<api::SynchronizeResponse> {
        ttrpc_call!(self, synchronize, req)
    }
    async fn shutdown(&self, req: api::ShutdownRequest) -> Result<api::Empty> {
        ttrpc_call!(self, shutdown, req)
    }
    async fn create_container(&self, req: api::CreateContainerRequest) -> Result<api::CreateContainerResponse> {
        ttrpc_call!(self, create_container, req)
    }
    async fn post_create_container(&self, req: api::PostCreateContainerRequest) -> Result<api::PostCreateContainerResponse> {
        ttrpc_call!(self, post_create_container, req)
    }
    async fn start_container(&self, req: api::StartContainerRequest) -> Result<api::StartContainerResponse> {
        ttrpc_call!(self, start_container, req)
    }
    async fn post_start_container(&self, req: api::PostStartContainerRequest) -> Result<api::PostStartContainerResponse> {
        ttrpc_call!(self, post_start_container, req)
    }
    async fn update_container(&self, req: api::UpdateContainerRequest) -> Result<api::UpdateContainerResponse> {
        ttrpc_call!(self, update_container, req)
    }
    async fn post_update_container(&self, req: api::PostUpdateContainerRequest) -> Result<api::PostUpdateContainerResponse> {
        ttrpc_call!(self, post_update_container, req)
    }
    async fn stop_container(&self, req: api::StopContainerRequest) -> Result<api::StopContainerResponse> {
        ttrpc_call!(self, stop_container, req)
    }
    async fn remove_container(&self, req: api::RemoveContainerRequest) -> Result<api::RemoveContainerResponse> {
        ttrpc_call!(self, remove_container, req)
    }
    async fn run_pod_sandbox(&self, req: api::RunPodSandboxRequest) -> Result<api::RunPodSandboxResponse> {
        ttrpc_call!(self, run_pod_sandbox, req)
    }
    async fn stop_pod_sandbox(&self, req: api::StopPodSandboxRequest) -> Result<api::StopPodSandboxResponse> {
        ttrpc_call!(self, stop_pod_sandbox, req)
    }
    async fn remove_pod_sandbox(&self, req: api::RemovePodSandboxRequest) -> Result<api::RemovePodSandboxResponse> {
        ttrpc_call!(self, remove_pod_sandbox, req)
    }
    async fn update_pod_sandbox(&self, req: api::UpdatePodSandboxRequest) -> Result<api::UpdatePodSandboxResponse> {
        ttrpc_call!(self, update_pod_sandbox, req)
    }
    async fn post_update_pod_sandbox(&self, req: api::PostUpdatePodSandboxRequest) -> Result<api::PostUpdatePodSandboxResponse> {
        ttrpc_call!(self, post_update_pod_sandbox, req)
    }
    async fn validate_container_adjustment(
        &self,
        req: api::ValidateContainerAdjustmentRequest,
    ) -> Result<api::ValidateContainerAdjustmentResponse> {
        ttrpc_call!(self, validate_container_adjustment, req)
    }

    async fn close(&self) {
        self.mux.shutdown().await;
        if let Some(child) = &self.child {
            if let Some(mut child) = child.lock().await.take() {
                let _ = child.kill().await;
            }
        }
    }
}

/// Plugin hosted as an external process, spawned by the orchestrator over
/// a freshly created socketpair. The child inherits the plugin half on fd
/// 3 and discovers it via `NRI_PLUGIN_SOCKET=3`.
pub struct ExternalTransport;

impl ExternalTransport {
    pub async fn spawn(
        path: &std::path::Path,
        plugin_name: &str,
        plugin_idx: &str,
        args: &[String],
    ) -> Result<(Box<dyn PluginTransport>, Arc<Mux>)> {
        let (runtime_half, plugin_half) = StdUnixStream::pair().map_err(Error::Transport)?;
        runtime_half.set_nonblocking(true).map_err(Error::Transport)?;

        let mut cmd = Command::new(path);
        cmd.args(args)
            .env("NRI_PLUGIN_NAME", plugin_name)
            .env("NRI_PLUGIN_IDX", plugin_idx)
            .env("NRI_PLUGIN_SOCKET", PLUGIN_SOCKET_FD.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        // SAFETY: `pre_exec` runs in the forked child before exec; it only
        // duplicates the socketpair half onto fd 3 and closes the
        // now-unneeded original descriptor. No allocation, no shared
        // state with the parent beyond the raw fd.
        unsafe {
            use std::os::unix::io::AsRawFd;
            use std::os::unix::process::CommandExt;
            let plugin_fd = plugin_half.as_raw_fd();
            cmd.pre_exec(move || {
                if plugin_fd != PLUGIN_SOCKET_FD {
                    libc_dup2(plugin_fd, PLUGIN_SOCKET_FD)?;
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(Error::Transport)?;
        drop(plugin_half);

        let tokio_stream = UnixStream::from_std(runtime_half).map_err(Error::Transport)?;
        let (transport, mux) = build_ttrpc_transport(tokio_stream, Some(child)).await?;
        Ok((Box::new(transport), mux))
    }
}

/// Thin wrapper around `dup2` so we don't pull in the `nix` crate for one
/// syscall used only inside a `pre_exec` closure.
fn libc_dup2(oldfd: RawFd, newfd: RawFd) -> std::io::Result<()> {
    // SAFETY: both descriptors are valid for the duration of this call,
    // which runs post-fork, pre-exec, single-threaded.
    let rc = unsafe { libc::dup2(oldfd, newfd) };
    if rc < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Plugin that connected to the orchestrator's listening socket before
/// registering, rather than being spawned by it (e.g. a plugin started
/// out-of-band by a system service manager).
pub struct PreConnectedTransport;

impl PreConnectedTransport {
    pub async fn from_stream(stream: UnixStream) -> Result<(Box<dyn PluginTransport>, Arc<Mux>)> {
        let (transport, mux) = build_ttrpc_transport(stream, None).await?;
        Ok((Box::new(transport), mux))
    }
}

async fn build_ttrpc_transport(stream: UnixStream, child: Option<Child>) -> Result<(TtrpcBackedTransport, Arc<Mux>)> {
    let mux = Arc::new(Mux::new(stream));
    plugin_client_over(mux, child).await
}

/// Opens the plugin-service connection as a ttrpc client against an
/// already-constructed mux, wrapping it as a [`TtrpcBackedTransport`].
/// Shared by every hosting mode: only how the mux's trunk is obtained
/// differs (socketpair, pre-connected socket, in-memory duplex pipe).
async fn plugin_client_over(mux: Arc<Mux>, child: Option<Child>) -> Result<(TtrpcBackedTransport, Arc<Mux>)> {
    let logical = mux.open(mux::PLUGIN_SERVICE_CONN).await?;
    let ttrpc_socket = ttrpc::r#async::transport::Socket::new(logical);
    let client = ttrpc::r#async::Client::new(ttrpc_socket);
    let transport = TtrpcBackedTransport {
        client: PluginClient::new(client),
        mux: mux.clone(),
        child: child.map(|c| tokio::sync::Mutex::new(Some(c))),
    };
    Ok((transport, mux))
}

/// A function-table based plugin compiled directly into the orchestrator
/// binary. No ttrpc, no serialization: calls dispatch straight to the
/// closures supplied at registration.
pub struct BuiltinTransport {
    handlers: Box<dyn BuiltinHandlers>,
}

/// The subset of [`PluginTransport`] a builtin plugin actually needs to
/// implement; defaults cover the rest as no-ops so small builtins (e.g. a
/// pure validator) don't have to stub every event.
#[async_trait]
pub trait BuiltinHandlers: Send + Sync {
    async fn configure(&self, _req: api::ConfigureRequest) -> Result<api::ConfigureResponse> {
        Ok(api::ConfigureResponse::new())
    }
    async fn synchronize(&self, _req: api::SynchronizeRequest) -> Result<api::SynchronizeResponse> {
        Ok(api::SynchronizeResponse::new())
    }
    async fn shutdown(&self, _req: api::ShutdownRequest) -> Result<api::Empty> {
        Ok(api::Empty::new())
    }
    async fn create_container(&self, _req: api::CreateContainerRequest) -> Result<api::CreateContainerResponse> {
        Ok(api::CreateContainerResponse::new())
    }
    async fn validate_container_adjustment(
        &self,
        _req: api::ValidateContainerAdjustmentRequest,
    ) -> Result<api::ValidateContainerAdjustmentResponse> {
        Ok(api::ValidateContainerAdjustmentResponse::new())
    }
}

impl BuiltinTransport {
    pub fn new(handlers: impl BuiltinHandlers + 'static) -> Box<dyn PluginTransport> {
        Box::new(BuiltinTransport {
            handlers: Box::new(handlers),
        })
    }
}

#[async_trait]
impl PluginTransport for BuiltinTransport {
    async fn configure(&self, req: api::ConfigureRequest) -> Result<api::ConfigureResponse> {
        self.handlers.configure(req).await
    }
    async fn synchronize(&self, req: api::SynchronizeRequest) -> Result<api::SynchronizeResponse> {
        self.handlers.synchronize(req).await
    }
    async fn shutdown(&self, req: api::ShutdownRequest) -> Result<api::Empty> {
        self.handlers.shutdown(req).await
    }
    async fn create_container(&self, req: api::CreateContainerRequest) -> Result<api::CreateContainerResponse> {
        self.handlers.create_container(req).await
    }
    async fn post_create_container(&self, _req: api::PostCreateContainerRequest) -> Result<api::PostCreateContainerResponse> {
        Ok(api::PostCreateContainerResponse::new())
    }
    async fn start_container(&self, _req: api::StartContainerRequest) -> Result<api::StartContainerResponse> {
        Ok(api::StartContainerResponse::new())
    }
    async fn post_start_container(&self, _req: api::PostStartContainerRequest) -> Result<api::PostStartContainerResponse> {
        Ok(api::PostStartContainerResponse::new())
    }
    async fn update_container(&self, _req: api::UpdateContainerRequest) -> Result<api::UpdateContainerResponse> {
        Ok(api::UpdateContainerResponse::new())
    }
    async fn post_update_container(&self, _req: api::PostUpdateContainerRequest) -> Result<api::PostUpdateContainerResponse> {
        Ok(api::PostUpdateContainerResponse::new())
    }
    async fn stop_container(&self, _req: api::StopContainerRequest) -> Result<api::StopContainerResponse> {
        Ok(api::StopContainerResponse::new())
    }
    async fn remove_container(&self, _req: api::RemoveContainerRequest) -> Result<api::RemoveContainerResponse> {
        Ok(api::RemoveContainerResponse::new())
    }
    async fn run_pod_sandbox(&self, _req: api::RunPodSandboxRequest) -> Result<api::RunPodSandboxResponse> {
        Ok(api::RunPodSandboxResponse::new())
    }
    async fn stop_pod_sandbox(&self, _req: api::StopPodSandboxRequest) -> Result<api::StopPodSandboxResponse> {
        Ok(api::StopPodSandboxResponse::new())
    }
    async fn remove_pod_sandbox(&self, _req: api::RemovePodSandboxRequest) -> Result<api::RemovePodSandboxResponse> {
        Ok(api::RemovePodSandboxResponse::new())
    }
    async fn update_pod_sandbox(&self, _req: api::UpdatePodSandboxRequest) -> Result<api::UpdatePodSandboxResponse> {
        Ok(api::UpdatePodSandboxResponse::new())
    }
    async fn post_update_pod_sandbox(&self, _req: api::PostUpdatePodSandboxRequest) -> Result<api::PostUpdatePodSandboxResponse> {
        Ok(api::PostUpdatePodSandboxResponse::new())
    }
    async fn validate_container_adjustment(
        &self,
        req: api::ValidateContainerAdjustmentRequest,
    ) -> Result<api::ValidateContainerAdjustmentResponse> {
        self.handlers.validate_container_adjustment(req).await
    }
    async fn close(&self) {}
}

#[cfg(feature = "wasm")]
pub mod wasm {
    //! Plugin hosted as a sandboxed WebAssembly module. Host functions
    //! expose only structured logging; all lifecycle calls cross the
    //! wasm boundary through the same mux'd ttrpc transport a process
    //! plugin would use, over an in-memory duplex pipe instead of a
    //! socketpair.

    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::Mutex as TokioMutex;
    use tokio::task::JoinHandle;
    use wasmtime::{Caller, Config, Engine, Linker, Module, Store};

    const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6d];
    const PIPE_BUF: usize = 64 * 1024;

    pub fn looks_like_wasm(bytes: &[u8]) -> bool {
        bytes.len() >= 4 && bytes[0..4] == WASM_MAGIC
    }

    struct HostState {
        plugin_name: String,
        far: Arc<TokioMutex<DuplexStream>>,
    }

    pub struct WasmTransport {
        inner: TtrpcBackedTransport,
        // Drives the module's exported server entrypoint for the
        // transport's lifetime; aborted on close.
        server_task: JoinHandle<()>,
    }

    impl WasmTransport {
        pub async fn instantiate(plugin_name: &str, module_bytes: &[u8]) -> Result<(Box<dyn PluginTransport>, Arc<Mux>)> {
            let mut config = Config::new();
            config.async_support(true);
            let engine = Engine::new(&config).map_err(|e| Error::Other(anyhow::anyhow!("wasm engine setup failed: {e}")))?;
            let module = Module::new(&engine, module_bytes)
                .map_err(|e| Error::Other(anyhow::anyhow!("invalid wasm module: {e}")))?;

            // `near` is what the orchestrator dials as a normal mux
            // trunk; `far` is handed to the module through the
            // `nri_host` pipe functions, so the module's own ttrpc
            // server reads and writes the same framed byte stream a
            // process plugin would see on its socketpair half.
            let (near, far) = duplex(PIPE_BUF);
            let far = Arc::new(TokioMutex::new(far));

            let mut linker: Linker<HostState> = Linker::new(&engine);
            register_host_log_functions(&mut linker)
                .map_err(|e| Error::Other(anyhow::anyhow!("wasm linker setup failed: {e}")))?;
            register_host_pipe_functions(&mut linker)
                .map_err(|e| Error::Other(anyhow::anyhow!("wasm linker setup failed: {e}")))?;

            let mut store = Store::new(
                &engine,
                HostState {
                    plugin_name: plugin_name.to_string(),
                    far,
                },
            );
            let instance = linker
                .instantiate_async(&mut store, &module)
                .await
                .map_err(|e| Error::Other(anyhow::anyhow!("wasm instantiation failed: {e}")))?;

            let serve = instance
                .get_typed_func::<(), ()>(&mut store, "nri_plugin_serve")
                .map_err(|e| Error::Other(anyhow::anyhow!("wasm module is missing the nri_plugin_serve export: {e}")))?;

            let module_plugin_name = plugin_name.to_string();
            let server_task = tokio::spawn(async move {
                if let Err(e) = serve.call_async(&mut store, ()).await {
                    log::warn!("plugin {module_plugin_name} wasm server exited: {e}");
                }
            });

            let mux = Arc::new(Mux::new(near));
            let (transport, mux) = plugin_client_over(mux, None).await?;

            Ok((
                Box::new(WasmTransport {
                    inner: transport,
                    server_task,
                }),
                mux,
            ))
        }
    }

    fn register_host_log_functions(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
        linker.func_wrap(
            "nri_host",
            "log_debug",
            |caller: Caller<'_, HostState>, ptr: i32, len: i32| host_log(caller, ptr, len, log::Level::Debug),
        )?;
        linker.func_wrap(
            "nri_host",
            "log_info",
            |caller: Caller<'_, HostState>, ptr: i32, len: i32| host_log(caller, ptr, len, log::Level::Info),
        )?;
        linker.func_wrap(
            "nri_host",
            "log_warn",
            |caller: Caller<'_, HostState>, ptr: i32, len: i32| host_log(caller, ptr, len, log::Level::Warn),
        )?;
        linker.func_wrap(
            "nri_host",
            "log_error",
            |caller: Caller<'_, HostState>, ptr: i32, len: i32| host_log(caller, ptr, len, log::Level::Error),
        )?;
        Ok(())
    }

    fn host_log(mut caller: Caller<'_, HostState>, ptr: i32, len: i32, level: log::Level) {
        let Some(memory) = caller.get_export("memory").and_then(|e| e.into_memory()) else {
            return;
        };
        let mut buf = vec![0u8; len.max(0) as usize];
        if memory.read(&mut caller, ptr as usize, &mut buf).is_err() {
            return;
        }
        let msg = String::from_utf8_lossy(&buf);
        let plugin_name = caller.data().plugin_name.clone();
        log::log!(level, "[{plugin_name}] {msg}");
    }

    /// Host functions the module's own ttrpc server calls to move bytes
    /// across the duplex pipe, mirroring the read/write fd an external
    /// process plugin gets on its socketpair half. Both take a
    /// `(ptr, len)` buffer in the module's linear memory and return the
    /// number of bytes transferred, or `-1` on error.
    fn register_host_pipe_functions(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
        linker.func_wrap_async("nri_host", "pipe_read", |mut caller: Caller<'_, HostState>, (ptr, len): (i32, i32)| {
            Box::new(async move {
                let far = caller.data().far.clone();
                let mut buf = vec![0u8; len.max(0) as usize];
                let n = {
                    let mut far = far.lock().await;
                    match far.read(&mut buf).await {
                        Ok(n) => n,
                        Err(_) => return -1i32,
                    }
                };
                let Some(memory) = caller.get_export("memory").and_then(|e| e.into_memory()) else {
                    return -1;
                };
                if memory.write(&mut caller, ptr as usize, &buf[..n]).is_err() {
                    return -1;
                }
                n as i32
            })
        })?;
        linker.func_wrap_async("nri_host", "pipe_write", |mut caller: Caller<'_, HostState>, (ptr, len): (i32, i32)| {
            Box::new(async move {
                let Some(memory) = caller.get_export("memory").and_then(|e| e.into_memory()) else {
                    return -1;
                };
                let mut buf = vec![0u8; len.max(0) as usize];
                if memory.read(&caller, ptr as usize, &mut buf).is_err() {
                    return -1;
                }
                let far = caller.data().far.clone();
                let mut far = far.lock().await;
                match far.write_all(&buf).await {
                    Ok(()) => len,
                    Err(_) => -1,
                }
            })
        })?;
        Ok(())
    }

    #[async_trait]
    impl PluginTransport for WasmTransport {
        async fn configure(&self, req: api::ConfigureRequest) -> Result<api::ConfigureResponse> {
            self.inner.configure(req).await
        }
        async fn synchronize(&self, req: api::SynchronizeRequest) -> Result<api::SynchronizeResponse> {
            self.inner.synchronize(req).await
        }
        async fn shutdown(&self, req: api::ShutdownRequest) -> Result<api::Empty> {
            self.inner.shutdown(req).await
        }
        async fn create_container(&self, req: api::CreateContainerRequest) -> Result<api::CreateContainerResponse> {
            self.inner.create_container(req).await
        }
        async fn post_create_container(&self, req: api::PostCreateContainerRequest) -> Result<api::PostCreateContainerResponse> {
            self.inner.post_create_container(req).await
        }
        async fn start_container(&self, req: api::StartContainerRequest) -> Result<api::StartContainerResponse> {
            self.inner.start_container(req).await
        }
        async fn post_start_container(&self, req: api::PostStartContainerRequest) -> Result<api::PostStartContainerResponse> {
            self.inner.post_start_container(req).await
        }
        async fn update_container(&self, req: api::UpdateContainerRequest) -> Result<api::UpdateContainerResponse> {
            self.inner.update_container(req).await
        }
        async fn post_update_container(&self, req: api::PostUpdateContainerRequest) -> Result<api::PostUpdateContainerResponse> {
            self.inner.post_update_container(req).await
        }
        async fn stop_container(&self, req: api::StopContainerRequest) -> Result<api::StopContainerResponse> {
            self.inner.stop_container(req).await
        }
        async fn remove_container(&self, req: api::RemoveContainerRequest) -> Result<api::RemoveContainerResponse> {
            self.inner.remove_container(req).await
        }
        async fn run_pod_sandbox(&self, req: api::RunPodSandboxRequest) -> Result<api::RunPodSandboxResponse> {
            self.inner.run_pod_sandbox(req).await
        }
        async fn stop_pod_sandbox(&self, req: api::StopPodSandboxRequest) -> Result<api::StopPodSandboxResponse> {
            self.inner.stop_pod_sandbox(req).await
        }
        async fn remove_pod_sandbox(&self, req: api::RemovePodSandboxRequest) -> Result<api::RemovePodSandboxResponse> {
            self.inner.remove_pod_sandbox(req).await
        }
        async fn update_pod_sandbox(&self, req: api::UpdatePodSandboxRequest) -> Result<api::UpdatePodSandboxResponse> {
            self.inner.update_pod_sandbox(req).await
        }
        async fn post_update_pod_sandbox(&self, req: api::PostUpdatePodSandboxRequest) -> Result<api::PostUpdatePodSandboxResponse> {
            self.inner.post_update_pod_sandbox(req).await
        }
        async fn validate_container_adjustment(
            &self,
            req: api::ValidateContainerAdjustmentRequest,
        ) -> Result<api::ValidateContainerAdjustmentResponse> {
            self.inner.validate_container_adjustment(req).await
        }
        async fn close(&self) {
            self.server_task.abort();
            self.inner.close().await
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn async_engine() -> Engine {
            let mut config = Config::new();
            config.async_support(true);
            Engine::new(&config).unwrap()
        }

        #[test]
        fn detects_wasm_magic_number() {
            assert!(looks_like_wasm(&[0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00]));
            assert!(!looks_like_wasm(b"#!/bin/sh\n"));
            assert!(!looks_like_wasm(&[]));
        }

        #[test]
        fn host_log_functions_link_against_the_expected_module_name() {
            let engine = async_engine();
            let mut linker: Linker<HostState> = Linker::new(&engine);
            register_host_log_functions(&mut linker).unwrap();
            let (_near, far) = duplex(PIPE_BUF);
            let mut store = Store::new(
                &engine,
                HostState {
                    plugin_name: "t".into(),
                    far: Arc::new(TokioMutex::new(far)),
                },
            );
            for name in ["log_debug", "log_info", "log_warn", "log_error"] {
                assert!(linker.get(&mut store, "nri_host", name).is_some());
            }
        }

        #[test]
        fn pipe_functions_link_against_the_expected_module_name() {
            let engine = async_engine();
            let mut linker: Linker<HostState> = Linker::new(&engine);
            register_host_pipe_functions(&mut linker).unwrap();
            let (_near, far) = duplex(PIPE_BUF);
            let mut store = Store::new(
                &engine,
                HostState {
                    plugin_name: "t".into(),
                    far: Arc::new(TokioMutex::new(far)),
                },
            );
            for name in ["pipe_read", "pipe_write"] {
                assert!(linker.get(&mut store, "nri_host", name).is_some());
            }
        }
    }
}
