//! hwtopo Render - Drawing contract and export backends
//!
//! This crate provides what visual exporters need on top of a finished topology:
//! - The `DrawMethods` contract receiving boxes, lines and text
//! - Object labels honoring PCI collapse annotations
//! - A simple indented tree walker driving any `DrawMethods`
//! - A FIG 3.2 vector backend with a per-output color registry

pub mod color;
pub mod draw;
pub mod fig;
pub mod label;

pub use color::Color;
pub use draw::{draw_topology, DrawMethods, RenderError, RenderOptions};
pub use fig::FigOutput;
pub use label::object_label;
