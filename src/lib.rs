// Data shaping for the Nashville TRMNL dashboard plugins.
//
// Each tile is one fetch cycle: pull the public feeds, reduce them to the
// handful of display fields the tile shows, hand them back as JSON. Nothing
// is kept between cycles.

pub mod alerts;
pub mod civic_feeds;
pub mod departures;
pub mod error;
pub mod transit_map;
pub mod wego_api_models;

mod lenient;
