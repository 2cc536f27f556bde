//! MeshView Service
//!
//! Loads a textured triangle mesh and draws it every frame through an
//! explicit-submission GPU backend:
//! 1. Reads the configuration and the scene/texture assets
//! 2. Creates the device, swap chain and every GPU object up front
//! 3. Uploads the texture through a staging buffer
//! 4. Records, submits and presents one command list per frame
//! 5. Drains the GPU before tearing everything down

mod backend;
mod bitmap;
mod camera;
mod command;
mod config;
mod descriptor;
mod error;
mod frame;
mod input;
mod layout;
mod presentation;
mod recorder;
mod renderer;
mod scene;
mod state;
mod sync;
mod upload;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::backend::headless::{HeadlessBackend, HeadlessOptions};
use crate::backend::Surface;
use crate::bitmap::Bitmap;
use crate::config::Config;
use crate::input::{EventQueue, WindowEvent};
use crate::presentation::PresentationMode;
use crate::renderer::Renderer;
use crate::scene::Scene;

/// Configuration file looked up in the working directory
const CONFIG_FILE: &str = "meshview.toml";

/// Viewer service state
struct ViewerService {
    config: Config,
    shutdown: Arc<AtomicBool>,
}

impl ViewerService {
    fn new(config: Config) -> Self {
        Self {
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    fn load_assets(&self) -> Result<(Scene, Bitmap)> {
        let scene = Scene::load(&self.config.scene_path).with_context(|| {
            format!("Failed to load scene {}", self.config.scene_path.display())
        })?;
        let bitmap = Bitmap::load(&self.config.texture_path)?;
        Ok((scene, bitmap))
    }

    /// Feed the shutdown flag into the event stream so teardown always runs
    /// through the renderer's final drain.
    fn forward_shutdown(&self, events: &mut EventQueue) {
        if self.shutdown.load(Ordering::Relaxed) {
            events.push(WindowEvent::CloseRequested);
        }
    }

    fn run(&mut self) -> Result<()> {
        match self.config.mode()? {
            PresentationMode::Windowed => self.run_windowed(),
            PresentationMode::Headless => self.run_headless(),
        }
    }

    /// Render a fixed number of frames on the simulated GPU.
    fn run_headless(&mut self) -> Result<()> {
        let (scene, bitmap) = self.load_assets()?;
        let (width, height) = self.config.headless_size();
        let backend = HeadlessBackend::new(HeadlessOptions::default());
        let mut renderer = Renderer::init(
            backend,
            &Surface::headless(width, height),
            scene.vertices(),
            bitmap,
            self.config.renderer_settings(),
        )?;

        info!("Rendering {} headless frames", self.config.headless_frames);
        let mut events = EventQueue::new();
        for _ in 0..self.config.headless_frames {
            self.forward_shutdown(&mut events);
            events.push(WindowEvent::Paint);
            if !renderer.tick(&mut events)? {
                info!("Shutdown requested");
                break;
            }
        }

        info!("Presented {} frames", renderer.backend().presented_frames());
        renderer.destroy()?;
        Ok(())
    }

    #[cfg(windows)]
    fn run_windowed(&mut self) -> Result<()> {
        use crate::backend::d3d12::D3D12Backend;
        use crate::presentation::Window;

        let (scene, bitmap) = self.load_assets()?;
        let backend = D3D12Backend::new(self.config.use_warp_device)?;

        let mut window = Window::create("MeshView", self.config.width, self.config.height)?;
        let mut renderer = Renderer::init(
            backend,
            &window.surface(),
            scene.vertices(),
            bitmap,
            self.config.renderer_settings(),
        )?;

        info!("Entering render loop...");
        while window.pump() {
            self.forward_shutdown(window.events());
            // draw continuously; WM_PAINT only arrives when the window is exposed
            window.events().push(WindowEvent::Paint);
            if !renderer.tick(window.events())? {
                break;
            }
        }

        renderer.destroy()?;
        info!("Window closed");
        Ok(())
    }

    #[cfg(not(windows))]
    fn run_windowed(&mut self) -> Result<()> {
        tracing::warn!("Windowed presentation needs Direct3D 12; rendering headless instead");
        self.run_headless()
    }
}

fn load_config() -> Result<Config> {
    let path = Path::new(CONFIG_FILE);
    if path.exists() {
        Config::load(path)
    } else {
        Ok(Config::default())
    }
}

fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("MeshView starting...");

    let config = load_config()?;
    info!("Configuration loaded: {:?}", config);

    let mut service = ViewerService::new(config);

    // Setup Ctrl+C handler
    let shutdown = service.shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        shutdown.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl+C handler")?;

    let result = service.run();
    if let Err(ref e) = result {
        error!("Fatal: {:#}", e);
    }

    info!("MeshView shutting down");
    result
}
