// src/gui.rs
//! Debug GUI built with egui.
//!
//! [`Gui::build`] runs one egui frame against the scene state and returns
//! [`GuiDrawData`]: tessellated primitives plus texture changes, ready for
//! the device's GUI pass. Platform input/output stays with the window
//! runner (`egui-winit`).

use egui::{
    load::SizedTexture, Color32, Context as EguiContext, DragValue, FontId, Margin, Rounding,
    Slider, TextStyle, Visuals, Window,
};
use egui_wgpu::ScreenDescriptor;

use crate::scene::SceneState;

/// Everything the GUI pass needs, detached from the egui context.
#[derive(Debug, Clone)]
pub struct GuiDrawData {
    pub primitives: Vec<egui::ClippedPrimitive>,
    pub textures_delta: egui::TexturesDelta,
    pub size_in_pixels: [u32; 2],
    pub pixels_per_point: f32,
}

impl GuiDrawData {
    /// Draw data with nothing to draw.
    pub fn empty(size_in_pixels: [u32; 2]) -> Self {
        Self {
            primitives: Vec::new(),
            textures_delta: egui::TexturesDelta::default(),
            size_in_pixels,
            pixels_per_point: 1.0,
        }
    }

    pub fn screen_descriptor(&self) -> ScreenDescriptor {
        ScreenDescriptor {
            size_in_pixels: self.size_in_pixels,
            pixels_per_point: self.pixels_per_point,
        }
    }
}

/// Numbers shown in the stats section.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameStats {
    pub fps: f32,
    pub frame_ms: f32,
    pub frames: u64,
    pub dropped: u64,
}

/// The offscreen scene target as the GUI sees it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneView {
    pub texture: Option<egui::TextureId>,
    pub size: (u32, u32),
}

pub struct GuiOutput {
    pub draw_data: GuiDrawData,
    pub platform_output: egui::PlatformOutput,
}

pub struct Gui {
    ctx: EguiContext,
    /// Viewport size being edited, applied with the button.
    viewport_edit: [u32; 2],
}

impl Default for Gui {
    fn default() -> Self {
        Self::new()
    }
}

impl Gui {
    pub fn new() -> Self {
        let ctx = EguiContext::default();
        apply_theme(&ctx);
        Self {
            ctx,
            viewport_edit: [0, 0],
        }
    }

    pub fn context(&self) -> &EguiContext {
        &self.ctx
    }

    /// Runs one GUI frame. Widgets edit `scene` in place; the camera is
    /// touched when its sliders move.
    pub fn build(
        &mut self,
        raw_input: egui::RawInput,
        size_in_pixels: [u32; 2],
        scene: &mut SceneState,
        view: SceneView,
        stats: &FrameStats,
    ) -> GuiOutput {
        if self.viewport_edit == [0, 0] {
            self.viewport_edit = [scene.viewport.0, scene.viewport.1];
        }

        let ctx = self.ctx.clone();
        let full_output = ctx.run(raw_input, |ctx| {
            scene_window(ctx, view);
            self.settings_window(ctx, scene, stats);
        });

        let primitives = self
            .ctx
            .tessellate(full_output.shapes, full_output.pixels_per_point);

        GuiOutput {
            draw_data: GuiDrawData {
                primitives,
                textures_delta: full_output.textures_delta,
                size_in_pixels,
                pixels_per_point: full_output.pixels_per_point,
            },
            platform_output: full_output.platform_output,
        }
    }

    fn settings_window(&mut self, ctx: &EguiContext, scene: &mut SceneState, stats: &FrameStats) {
        Window::new("Settings").show(ctx, |ui| {
            ui.collapsing("Camera", |ui| {
                let position = &mut scene.camera.position;
                let mut moved = false;
                moved |= ui.add(Slider::new(&mut position.x, -50.0..=50.0).text("X")).changed();
                moved |= ui.add(Slider::new(&mut position.y, -50.0..=50.0).text("Y")).changed();
                moved |= ui.add(Slider::new(&mut position.z, -50.0..=50.0).text("Z")).changed();
                if moved {
                    scene.camera.touched = true;
                }
                ui.checkbox(&mut scene.animate_camera, "Animate camera");
            });

            ui.collapsing("Spin Cube", |ui| {
                for rotation in scene.rotations.iter_mut() {
                    ui.add(Slider::new(&mut rotation.speed, -10.0..=10.0).text(rotation.name));
                }
            });

            ui.collapsing("Instancing", |ui| {
                ui.add(Slider::new(&mut scene.instancing.spread, 0.0..=10.0).text("Spread"));
                ui.add(Slider::new(&mut scene.instancing.dimension, 1..=16).text("Dimensions"));
            });

            ui.collapsing("Viewport", |ui| {
                ui.horizontal(|ui| {
                    ui.add(DragValue::new(&mut self.viewport_edit[0]).range(1..=8192));
                    ui.label("x");
                    ui.add(DragValue::new(&mut self.viewport_edit[1]).range(1..=8192));
                });
                let requested = (self.viewport_edit[0], self.viewport_edit[1]);
                if ui.button("Resize").clicked() && requested != scene.viewport {
                    scene.requested_viewport = Some(requested);
                }
            });

            ui.checkbox(&mut scene.wireframe, "Wireframe");

            ui.separator();
            ui.label(format!("{:.1} fps ({:.2} ms)", stats.fps, stats.frame_ms));
            ui.label(format!("frames: {}  dropped: {}", stats.frames, stats.dropped));
        });
    }
}

fn scene_window(ctx: &EguiContext, view: SceneView) {
    Window::new("Scene").show(ctx, |ui| match view.texture {
        Some(texture) => {
            let size = egui::vec2(view.size.0 as f32, view.size.1 as f32);
            ui.image(SizedTexture::new(texture, size));
        }
        None => {
            ui.label("Scene target unavailable");
        }
    });
}

fn apply_theme(ctx: &EguiContext) {
    let mut style = (*ctx.style()).clone();

    let mut visuals = Visuals::dark();
    visuals.panel_fill = Color32::from_rgb(20, 20, 24);
    visuals.window_fill = Color32::from_rgb(24, 24, 30);
    visuals.widgets.noninteractive.rounding = Rounding::same(4.0);
    visuals.widgets.inactive.rounding = Rounding::same(4.0);
    visuals.widgets.hovered.rounding = Rounding::same(4.0);
    visuals.widgets.active.rounding = Rounding::same(4.0);

    style.visuals = visuals;
    style.spacing.window_margin = Margin::same(8.0);
    style.text_styles.insert(TextStyle::Heading, FontId::proportional(18.0));
    ctx.set_style(style);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> SceneView {
        SceneView {
            texture: Some(egui::TextureId::User(7)),
            size: (64, 48),
        }
    }

    #[test]
    fn first_frame_uploads_fonts() {
        let mut gui = Gui::new();
        let mut scene = SceneState::default();
        let before = scene.clone();

        let output = gui.build(
            egui::RawInput::default(),
            [640, 480],
            &mut scene,
            view(),
            &FrameStats::default(),
        );

        assert!(!output.draw_data.textures_delta.set.is_empty());
        assert_eq!(output.draw_data.size_in_pixels, [640, 480]);

        // No input, so nothing was edited.
        assert_eq!(scene.wireframe, before.wireframe);
        assert_eq!(scene.camera.position, before.camera.position);
        assert_eq!(scene.requested_viewport, None);
    }

    #[test]
    fn viewport_edit_starts_at_scene_size() {
        let mut gui = Gui::new();
        let mut scene = SceneState::default();
        scene.viewport = (320, 200);
        gui.build(egui::RawInput::default(), [1, 1], &mut scene, view(), &FrameStats::default());
        assert_eq!(gui.viewport_edit, [320, 200]);
    }

    #[test]
    fn screen_descriptor_mirrors_fields() {
        let mut data = GuiDrawData::empty([800, 600]);
        data.pixels_per_point = 2.0;
        let desc = data.screen_descriptor();
        assert_eq!(desc.size_in_pixels, [800, 600]);
        assert_eq!(desc.pixels_per_point, 2.0);
    }
}
