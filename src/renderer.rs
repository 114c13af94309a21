//! SDL2 render and input surface.
//!
//! Draws the active view's video frame aspect-fitted into a fullscreen
//! window, outlines hotspot polygons while the aerial view is live, dims the
//! screen behind the info overlay, and forwards pointer/keyboard input.

use crate::hotspots::{HotspotKind, PixelPolygon};
use crate::media::VideoFrame;
use crate::tour::SharedView;
use anyhow::{Context, Result};
use sdl2::event::Event;
use sdl2::keyboard::Keycode;
use sdl2::mouse::MouseButton;
use sdl2::pixels::{Color, PixelFormatEnum};
use sdl2::rect::{Point, Rect};
use sdl2::render::{Canvas, TextureCreator};
use sdl2::video::{Window, WindowContext};

const PRIMARY_OUTLINE: Color = Color::RGB(64, 200, 255);
const SECONDARY_OUTLINE: Color = Color::RGB(255, 200, 64);
const HOVERED_OUTLINE: Color = Color::RGB(255, 255, 255);

/// Input events produced by the surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SurfaceInput {
    Click { x: f32, y: f32 },
    Move { x: f32, y: f32 },
    Back,
    House(u32),
    Quit,
}

/// The fullscreen kiosk surface.
pub struct Renderer {
    canvas: Canvas<Window>,
    event_pump: sdl2::EventPump,
    screen_width: u32,
    screen_height: u32,
}

impl Renderer {
    /// Initialize SDL2 and create a fullscreen window.
    pub fn new() -> Result<Self> {
        let sdl_context = sdl2::init().map_err(|e| anyhow::anyhow!("SDL init failed: {}", e))?;

        let video_subsystem = sdl_context
            .video()
            .map_err(|e| anyhow::anyhow!("SDL video init failed: {}", e))?;

        let display_mode = video_subsystem
            .desktop_display_mode(0)
            .map_err(|e| anyhow::anyhow!("Failed to get display mode: {}", e))?;

        let screen_width = display_mode.w as u32;
        let screen_height = display_mode.h as u32;

        tracing::info!(
            "Creating fullscreen window: {}x{}",
            screen_width,
            screen_height
        );

        let window = video_subsystem
            .window("Tour Viewer", screen_width, screen_height)
            .fullscreen_desktop()
            .build()
            .context("Failed to create window")?;

        let mut canvas = window
            .into_canvas()
            .accelerated()
            .present_vsync()
            .build()
            .context("Failed to create canvas")?;
        canvas.set_blend_mode(sdl2::render::BlendMode::Blend);

        canvas.set_draw_color(Color::RGB(0, 0, 0));
        canvas.clear();
        canvas.present();

        let event_pump = sdl_context
            .event_pump()
            .map_err(|e| anyhow::anyhow!("Failed to get event pump: {}", e))?;

        Ok(Self {
            canvas,
            event_pump,
            screen_width,
            screen_height,
        })
    }

    pub fn texture_creator(&self) -> TextureCreator<WindowContext> {
        self.canvas.texture_creator()
    }

    pub fn screen_size(&self) -> (u32, u32) {
        (self.screen_width, self.screen_height)
    }

    /// Drain pending SDL events. Pointer motion is collapsed to the latest
    /// position so a busy engine is not flooded with hover updates.
    pub fn poll_inputs(&mut self) -> Vec<SurfaceInput> {
        let mut inputs = Vec::new();
        let mut last_move = None;
        for event in self.event_pump.poll_iter() {
            match event {
                Event::Quit { .. } => inputs.push(SurfaceInput::Quit),
                Event::KeyDown {
                    keycode: Some(key), ..
                } => match key {
                    Keycode::Escape | Keycode::Q => inputs.push(SurfaceInput::Quit),
                    Keycode::Backspace | Keycode::B => inputs.push(SurfaceInput::Back),
                    Keycode::Num1 => inputs.push(SurfaceInput::House(1)),
                    Keycode::Num2 => inputs.push(SurfaceInput::House(2)),
                    Keycode::Num3 => inputs.push(SurfaceInput::House(3)),
                    Keycode::Num4 => inputs.push(SurfaceInput::House(4)),
                    Keycode::Num5 => inputs.push(SurfaceInput::House(5)),
                    Keycode::Num6 => inputs.push(SurfaceInput::House(6)),
                    Keycode::Num7 => inputs.push(SurfaceInput::House(7)),
                    Keycode::Num8 => inputs.push(SurfaceInput::House(8)),
                    Keycode::Num9 => inputs.push(SurfaceInput::House(9)),
                    _ => {}
                },
                Event::MouseMotion { x, y, .. } => {
                    last_move = Some(SurfaceInput::Move {
                        x: x as f32,
                        y: y as f32,
                    });
                }
                Event::MouseButtonDown {
                    mouse_btn: MouseButton::Left,
                    x,
                    y,
                    ..
                } => inputs.push(SurfaceInput::Click {
                    x: x as f32,
                    y: y as f32,
                }),
                Event::MouseButtonDown {
                    mouse_btn: MouseButton::Right,
                    ..
                } => inputs.push(SurfaceInput::Back),
                _ => {}
            }
        }
        if let Some(movement) = last_move {
            inputs.push(movement);
        }
        inputs
    }

    /// Draw one frame of the shared view state.
    pub fn render(
        &mut self,
        texture_creator: &TextureCreator<WindowContext>,
        view: &SharedView,
    ) -> Result<()> {
        self.canvas.set_draw_color(Color::RGB(0, 0, 0));
        self.canvas.clear();

        let frame = view
            .frame
            .read()
            .unwrap()
            .as_ref()
            .and_then(|slot| slot.lock().unwrap().clone());
        if let Some(frame) = frame {
            self.draw_frame(texture_creator, &frame)?;
        }

        let hovered = view.hovered.read().unwrap().clone();
        for polygon in view.polygons.read().unwrap().iter() {
            self.draw_polygon(polygon, hovered.as_deref())?;
        }

        if view.overlay.read().unwrap().is_some() {
            self.draw_overlay_backdrop()?;
        }

        self.canvas.present();
        Ok(())
    }

    fn draw_frame(
        &mut self,
        texture_creator: &TextureCreator<WindowContext>,
        frame: &VideoFrame,
    ) -> Result<()> {
        if frame.width == 0 || frame.height == 0 {
            return Ok(());
        }
        let mut texture = texture_creator
            .create_texture_streaming(PixelFormatEnum::ABGR8888, frame.width, frame.height)
            .context("Failed to create texture")?;

        texture
            .with_lock(None, |buffer: &mut [u8], pitch: usize| {
                let row_bytes = (frame.width as usize) * 4;
                for y in 0..frame.height as usize {
                    let src_offset = y * row_bytes;
                    let dst_offset = y * pitch;
                    buffer[dst_offset..dst_offset + row_bytes]
                        .copy_from_slice(&frame.pixels[src_offset..src_offset + row_bytes]);
                }
            })
            .map_err(|e| anyhow::anyhow!("Failed to update texture: {}", e))?;

        let dest = self.calculate_aspect_fit(frame.width, frame.height);
        self.canvas
            .copy(&texture, None, dest)
            .map_err(|e| anyhow::anyhow!("Failed to render frame: {}", e))?;
        Ok(())
    }

    /// Calculate aspect-fit rectangle for displaying a frame.
    fn calculate_aspect_fit(&self, img_width: u32, img_height: u32) -> Rect {
        let screen_ratio = self.screen_width as f32 / self.screen_height as f32;
        let img_ratio = img_width as f32 / img_height as f32;

        let (fit_width, fit_height) = if img_ratio > screen_ratio {
            let fit_width = self.screen_width;
            let fit_height = (self.screen_width as f32 / img_ratio) as u32;
            (fit_width, fit_height)
        } else {
            let fit_height = self.screen_height;
            let fit_width = (self.screen_height as f32 * img_ratio) as u32;
            (fit_width, fit_height)
        };

        let x = ((self.screen_width - fit_width) / 2) as i32;
        let y = ((self.screen_height - fit_height) / 2) as i32;

        Rect::new(x, y, fit_width, fit_height)
    }

    fn draw_polygon(&mut self, polygon: &PixelPolygon, hovered: Option<&str>) -> Result<()> {
        if polygon.points.len() < 3 {
            return Ok(());
        }
        let color = if hovered == Some(polygon.hotspot_id.as_str()) {
            HOVERED_OUTLINE
        } else {
            match polygon.kind {
                HotspotKind::Primary => PRIMARY_OUTLINE,
                HotspotKind::Secondary => SECONDARY_OUTLINE,
            }
        };
        self.canvas.set_draw_color(color);

        let mut points: Vec<Point> = polygon
            .points
            .iter()
            .map(|&(x, y)| Point::new(x as i32, y as i32))
            .collect();
        points.push(points[0]);
        self.canvas
            .draw_lines(points.as_slice())
            .map_err(|e| anyhow::anyhow!("Failed to draw polygon: {}", e))?;
        Ok(())
    }

    fn draw_overlay_backdrop(&mut self) -> Result<()> {
        self.canvas.set_draw_color(Color::RGBA(0, 0, 0, 180));
        let width = self.screen_width * 2 / 3;
        let height = self.screen_height / 3;
        let rect = Rect::new(
            ((self.screen_width - width) / 2) as i32,
            ((self.screen_height - height) / 2) as i32,
            width,
            height,
        );
        self.canvas
            .fill_rect(rect)
            .map_err(|e| anyhow::anyhow!("Failed to draw overlay: {}", e))?;
        self.canvas.set_draw_color(HOVERED_OUTLINE);
        self.canvas
            .draw_rect(rect)
            .map_err(|e| anyhow::anyhow!("Failed to draw overlay border: {}", e))?;
        Ok(())
    }
}
