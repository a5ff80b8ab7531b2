// Map scene for the next-bus tile: route line, stop marker and the live
// bus with a heading arrow.
//
// The scene is a Mapbox GL style fragment (sources, layers, images) that
// the tile markup hands straight to the map library. `TransitMap` owns one
// map instance at a time; the caller decides when it is created and torn
// down.

use geojson::{Feature, FeatureCollection, GeoJson, Geometry, JsonObject, Value as GeoValue};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;

use crate::error::{PluginError, Result};
use crate::wego_api_models::{Shape, Stop, VehiclePosition};

pub const MAP_STYLE: &str = "mapbox://styles/mapbox/light-v11";
pub const BUS_MARKER_IMAGE: &str =
    "https://raw.githubusercontent.com/transitnownash/wego-bus-map/refs/heads/main/public/logo192.png";
pub const BUS_IMAGE_ID: &str = "bus-marker-img";
pub const ARROW_IMAGE_ID: &str = "direction-arrow";

/// Downtown Nashville, used until a route is rendered.
const DEFAULT_CENTER: [f64; 2] = [-86.7816, 36.1627];
const DEFAULT_ZOOM: f64 = 12.0;
const FIT_PADDING: u32 = 40;
const DEFAULT_LINE_COLOR: &str = "#1a237e";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageData {
    Url { url: String },
    Svg { svg: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapImage {
    pub id: String,
    pub pixel_ratio: f64,
    #[serde(flatten)]
    pub data: ImageData,
}

#[derive(Debug, Clone, Serialize)]
pub struct MapSource {
    pub id: &'static str,
    pub data: GeoJson,
}

#[derive(Debug, Clone, Serialize)]
pub struct MapLayer {
    pub id: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub source: &'static str,
    pub layout: serde_json::Value,
    pub paint: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct MapScene {
    pub container: String,
    pub style: &'static str,
    pub center: [f64; 2],
    pub zoom: f64,
    /// `[[min_lon, min_lat], [max_lon, max_lat]]`
    pub bounds: [[f64; 2]; 2],
    pub padding: u32,
    pub interactive: bool,
    pub sources: Vec<MapSource>,
    pub layers: Vec<MapLayer>,
    pub images: Vec<MapImage>,
}

#[derive(Debug, Default)]
struct MapInstance {
    images: HashMap<String, MapImage>,
    scene: Option<MapScene>,
}

#[derive(Debug)]
pub struct TransitMap {
    container_id: String,
    instance: Option<MapInstance>,
}

impl TransitMap {
    pub fn new(container_id: impl Into<String>) -> Self {
        TransitMap {
            container_id: container_id.into(),
            instance: None,
        }
    }

    /// Starts a fresh map instance, dropping any previous one with its
    /// scene and image cache.
    pub fn initialize(&mut self) -> &mut Self {
        if self.instance.is_some() {
            self.destroy();
        }
        log::debug!("[TransitMap] initialize #{}", self.container_id);
        self.instance = Some(MapInstance::default());
        self
    }

    pub fn destroy(&mut self) {
        if self.instance.take().is_some() {
            log::debug!("[TransitMap] destroy #{}", self.container_id);
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.instance.is_some()
    }

    pub fn has_image(&self, id: &str) -> bool {
        self.instance
            .as_ref()
            .is_some_and(|instance| instance.images.contains_key(id))
    }

    pub fn scene(&self) -> Option<&MapScene> {
        self.instance.as_ref()?.scene.as_ref()
    }

    /// Runs `load` only when no image is registered under `id` yet.
    pub async fn ensure_image<F, Fut>(&mut self, id: &str, load: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MapImage>>,
    {
        let instance = self
            .instance
            .as_mut()
            .ok_or_else(|| PluginError::MapError("map is not initialized".to_string()))?;

        if instance.images.contains_key(id) {
            return Ok(());
        }

        let mut image = load().await?;
        image.id = id.to_string();
        log::debug!("[TransitMap] image '{}' loaded", id);
        instance.images.insert(id.to_string(), image);
        Ok(())
    }

    /// Builds the scene for one trip, replacing whatever was rendered
    /// before. Returns `None` when the map is not initialized or the shape
    /// has no usable points.
    pub async fn render(
        &mut self,
        shape: Option<&Shape>,
        stop: Option<&Stop>,
        vehicle: Option<&VehiclePosition>,
        route_color: Option<&str>,
    ) -> Option<&MapScene> {
        let points = valid_points(shape?);
        if !self.is_initialized() || points.is_empty() {
            return None;
        }

        let mut sources = Vec::new();
        let mut layers = Vec::new();

        let line_color = route_color.unwrap_or(DEFAULT_LINE_COLOR);
        sources.push(MapSource {
            id: "route",
            data: GeoJson::Feature(feature(GeoValue::LineString(points.clone()), JsonObject::new())),
        });
        layers.push(MapLayer {
            id: "route-line",
            kind: "line",
            source: "route",
            layout: json!({ "line-cap": "round", "line-join": "round" }),
            paint: json!({ "line-color": line_color, "line-width": 6 }),
        });

        if let Some([lon, lat]) = stop.and_then(stop_coordinates) {
            sources.push(MapSource {
                id: "stop",
                data: GeoJson::Feature(feature(GeoValue::Point(vec![lon, lat]), JsonObject::new())),
            });
            layers.push(circle_layer("stop-border", 8, "#ffffff"));
            layers.push(circle_layer("stop-marker", 6, "#000000"));
        }

        if let Some((coordinates, bearing)) = vehicle.and_then(vehicle_placement) {
            match self.load_bus_images().await {
                Ok(()) => {
                    let mut properties = JsonObject::new();
                    properties.insert("bearing".to_string(), json!(bearing));
                    sources.push(MapSource {
                        id: "bus",
                        data: GeoJson::FeatureCollection(FeatureCollection {
                            bbox: None,
                            features: vec![feature(GeoValue::Point(coordinates.to_vec()), properties)],
                            foreign_members: None,
                        }),
                    });
                    layers.extend(bus_layers());
                }
                Err(e) => log::warn!("[TransitMap] skipping bus marker: {}", e),
            }
        }

        let instance = self.instance.as_mut()?;
        let mut images: Vec<MapImage> = instance.images.values().cloned().collect();
        images.sort_by(|a, b| a.id.cmp(&b.id));

        instance.scene = Some(MapScene {
            container: self.container_id.clone(),
            style: MAP_STYLE,
            center: DEFAULT_CENTER,
            zoom: DEFAULT_ZOOM,
            bounds: bounds(&points),
            padding: FIT_PADDING,
            interactive: false,
            sources,
            layers,
            images,
        });
        instance.scene.as_ref()
    }

    async fn load_bus_images(&mut self) -> Result<()> {
        self.ensure_image(BUS_IMAGE_ID, || async {
            Ok::<_, PluginError>(MapImage {
                id: BUS_IMAGE_ID.to_string(),
                pixel_ratio: 2.0,
                data: ImageData::Url {
                    url: BUS_MARKER_IMAGE.to_string(),
                },
            })
        })
        .await?;

        self.ensure_image(ARROW_IMAGE_ID, || async {
            Ok::<_, PluginError>(MapImage {
                id: ARROW_IMAGE_ID.to_string(),
                pixel_ratio: 1.0,
                data: ImageData::Svg { svg: arrow_svg() },
            })
        })
        .await
    }
}

/// `[lon, lat]` pairs for points where both coordinates are present.
fn valid_points(shape: &Shape) -> Vec<Vec<f64>> {
    shape
        .points
        .iter()
        .filter_map(|pt| match (pt.lat, pt.lon) {
            (Some(lat), Some(lon)) => Some(vec![lon, lat]),
            _ => None,
        })
        .collect()
}

fn bounds(points: &[Vec<f64>]) -> [[f64; 2]; 2] {
    let mut min = [f64::INFINITY, f64::INFINITY];
    let mut max = [f64::NEG_INFINITY, f64::NEG_INFINITY];
    for point in points {
        for axis in 0..2 {
            min[axis] = min[axis].min(point[axis]);
            max[axis] = max[axis].max(point[axis]);
        }
    }
    [min, max]
}

/// Zero is treated as missing; the feed uses it as a placeholder.
fn stop_coordinates(stop: &Stop) -> Option<[f64; 2]> {
    let lat = stop.stop_lat.filter(|v| *v != 0.0)?;
    let lon = stop.stop_lon.filter(|v| *v != 0.0)?;
    Some([lon, lat])
}

fn vehicle_placement(vehicle: &VehiclePosition) -> Option<([f64; 2], f64)> {
    let position = vehicle.position.as_ref()?;
    let coordinates = [position.longitude?, position.latitude?];
    Some((coordinates, position.bearing.unwrap_or(0.0)))
}

fn feature(value: GeoValue, properties: JsonObject) -> Feature {
    Feature {
        bbox: None,
        geometry: Some(Geometry::new(value)),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

fn circle_layer(id: &'static str, radius: u32, color: &str) -> MapLayer {
    MapLayer {
        id,
        kind: "circle",
        source: "stop",
        layout: json!({}),
        paint: json!({
            "circle-radius": radius,
            "circle-color": color,
            "circle-stroke-width": 0
        }),
    }
}

fn bus_layers() -> [MapLayer; 2] {
    [
        MapLayer {
            id: "bus-marker",
            kind: "symbol",
            source: "bus",
            layout: json!({
                "icon-image": BUS_IMAGE_ID,
                "icon-size": 0.25,
                "icon-allow-overlap": true,
                "icon-anchor": "center"
            }),
            paint: json!({}),
        },
        MapLayer {
            id: "direction-arrow",
            kind: "symbol",
            source: "bus",
            layout: json!({
                "icon-image": ARROW_IMAGE_ID,
                "icon-size": 0.75,
                "icon-allow-overlap": true,
                "icon-offset": [0, -15],
                "icon-rotate": ["get", "bearing"],
                "icon-rotation-alignment": "map",
                "icon-anchor": "bottom"
            }),
            paint: json!({}),
        },
    ]
}

/// Black heading triangle on a wider white one, 12px plus 3px padding.
fn arrow_svg() -> String {
    const SIZE: i32 = 12;
    const PADDING: i32 = 3;
    const BORDER: i32 = 4;

    let canvas = SIZE + PADDING * 2;
    let middle = canvas / 2;
    let (top, bottom) = (PADDING, canvas - PADDING);
    let (left, right) = (PADDING, canvas - PADDING);

    format!(
        concat!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{c}" height="{c}" viewBox="0 0 {c} {c}">"#,
            r##"<polygon points="{m},{bt} {rb},{bb} {lb},{bb}" fill="#ffffff"/>"##,
            r##"<polygon points="{m},{t} {r},{b} {l},{b}" fill="#000000"/>"##,
            "</svg>"
        ),
        c = canvas,
        m = middle,
        t = top,
        b = bottom,
        l = left,
        r = right,
        bt = top - BORDER,
        bb = bottom + BORDER,
        lb = left - BORDER,
        rb = right + BORDER,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wego_api_models::{Position, ShapePoint};
    use std::cell::Cell;

    fn shape(points: &[(Option<f64>, Option<f64>)]) -> Shape {
        Shape {
            points: points
                .iter()
                .map(|&(lat, lon)| ShapePoint { lat, lon })
                .collect(),
        }
    }

    fn vehicle(lat: f64, lon: f64, bearing: Option<f64>) -> VehiclePosition {
        VehiclePosition {
            trip: None,
            position: Some(Position {
                latitude: Some(lat),
                longitude: Some(lon),
                bearing,
            }),
        }
    }

    fn layer_ids(scene: &MapScene) -> Vec<&str> {
        scene.layers.iter().map(|l| l.id).collect()
    }

    #[tokio::test]
    async fn render_requires_initialize() {
        let route = shape(&[(Some(36.1), Some(-86.8))]);
        let mut map = TransitMap::new("wego-map-canvas");
        assert!(map.render(Some(&route), None, None, None).await.is_none());

        map.initialize();
        assert!(map.render(Some(&route), None, None, None).await.is_some());

        map.destroy();
        assert!(!map.is_initialized());
        assert!(map.scene().is_none());
    }

    #[tokio::test]
    async fn render_skips_shapes_without_valid_points() {
        let mut map = TransitMap::new("wego-map-canvas");
        map.initialize();
        let broken = shape(&[(None, Some(-86.8)), (Some(36.1), None)]);
        assert!(map.render(Some(&broken), None, None, None).await.is_none());
        assert!(map.render(None, None, None, None).await.is_none());
    }

    #[tokio::test]
    async fn render_route_and_stop() {
        let mut map = TransitMap::new("wego-map-canvas");
        map.initialize();
        let route = shape(&[
            (Some(36.10), Some(-86.80)),
            (Some(36.20), Some(-86.70)),
            (None, None),
            (Some(36.15), Some(-86.90)),
        ]);
        let stop = Stop {
            stop_lat: Some(36.12),
            stop_lon: Some(-86.75),
            ..Default::default()
        };

        let scene = map
            .render(Some(&route), Some(&stop), None, Some("#E1251B"))
            .await
            .unwrap();

        assert_eq!(scene.bounds, [[-86.90, 36.10], [-86.70, 36.20]]);
        assert_eq!(layer_ids(scene), ["route-line", "stop-border", "stop-marker"]);
        assert_eq!(scene.layers[0].paint["line-color"], "#E1251B");
        assert!(scene.images.is_empty());

        let json = serde_json::to_value(scene).unwrap();
        assert_eq!(json["sources"][0]["data"]["geometry"]["type"], "LineString");
        assert_eq!(json["sources"][0]["data"]["geometry"]["coordinates"][0][0], -86.80);
        assert_eq!(json["layers"][0]["type"], "line");
    }

    #[tokio::test]
    async fn stop_at_zero_is_not_drawn() {
        let mut map = TransitMap::new("wego-map-canvas");
        map.initialize();
        let route = shape(&[(Some(36.1), Some(-86.8))]);
        let stop = Stop {
            stop_lat: Some(0.0),
            stop_lon: Some(-86.75),
            ..Default::default()
        };
        let scene = map.render(Some(&route), Some(&stop), None, None).await.unwrap();
        assert_eq!(layer_ids(scene), ["route-line"]);
        assert_eq!(scene.layers[0].paint["line-color"], "#1a237e");
    }

    #[tokio::test]
    async fn bus_marker_carries_bearing_and_images() {
        let mut map = TransitMap::new("wego-map-canvas");
        map.initialize();
        let route = shape(&[(Some(36.1), Some(-86.8))]);

        let scene = map
            .render(Some(&route), None, Some(&vehicle(36.16, -86.78, None)), None)
            .await
            .unwrap();
        assert_eq!(layer_ids(scene), ["route-line", "bus-marker", "direction-arrow"]);
        let json = serde_json::to_value(scene).unwrap();
        let bus = &json["sources"][1]["data"]["features"][0];
        assert_eq!(bus["properties"]["bearing"], 0.0);
        assert_eq!(bus["geometry"]["coordinates"][0], -86.78);
        let image_ids: Vec<&str> = scene.images.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(image_ids, [BUS_IMAGE_ID, ARROW_IMAGE_ID]);
        assert_eq!(json["images"][0]["kind"], "url");
        assert_eq!(json["images"][1]["kind"], "svg");
    }

    #[tokio::test]
    async fn rerender_replaces_previous_scene() {
        let mut map = TransitMap::new("wego-map-canvas");
        map.initialize();
        let route = shape(&[(Some(36.1), Some(-86.8))]);
        map.render(Some(&route), None, Some(&vehicle(36.16, -86.78, Some(45.0))), None)
            .await
            .unwrap();
        let scene = map.render(Some(&route), None, None, None).await.unwrap();
        assert_eq!(layer_ids(scene), ["route-line"]);
    }

    #[tokio::test]
    async fn images_load_once_per_instance() {
        let calls = Cell::new(0);
        let counter = &calls;
        let load = move || async move {
            counter.set(counter.get() + 1);
            Ok::<_, PluginError>(MapImage {
                id: String::new(),
                pixel_ratio: 1.0,
                data: ImageData::Svg { svg: arrow_svg() },
            })
        };

        let mut map = TransitMap::new("wego-map-canvas");
        assert!(map.ensure_image("arrow", load).await.is_err());
        assert_eq!(calls.get(), 0);

        map.initialize();
        map.ensure_image("arrow", load).await.unwrap();
        map.ensure_image("arrow", load).await.unwrap();
        assert_eq!(calls.get(), 1);
        assert!(map.has_image("arrow"));

        map.initialize();
        assert!(!map.has_image("arrow"));
        map.ensure_image("arrow", load).await.unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn failed_image_load_is_not_cached() {
        let mut map = TransitMap::new("wego-map-canvas");
        map.initialize();
        let result = map
            .ensure_image("bus", || async {
                Err::<MapImage, _>(PluginError::NetworkError("404".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert!(!map.has_image("bus"));
    }

    #[test]
    fn arrow_svg_geometry() {
        let svg = arrow_svg();
        assert!(svg.contains(r#"viewBox="0 0 18 18""#));
        assert!(svg.contains(r#"points="9,-1 19,19 -1,19""#));
        assert!(svg.contains(r#"points="9,3 15,15 3,15""#));
    }
}
