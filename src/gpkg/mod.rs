//! GeoPackage connection surface backed by rusqlite.

mod gpkg;

pub use gpkg::Gpkg;
