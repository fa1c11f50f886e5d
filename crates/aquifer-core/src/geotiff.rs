//! GeoTIFF raster I/O.
//!
//! TIFF storage order: row 0 = northernmost (N→S).
//! Raster storage order: row 0 = min_lat (S→N).
//! Rows are reversed on both read and write.
//!
//! Only the geographic (EPSG:4326, pixel-is-area) case is handled: the grid
//! comes from ModelPixelScale + ModelTiepoint; rotated ModelTransformation
//! rasters are rejected as un-georeferenced.

use std::fs;
use std::io::{self, BufWriter, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use log::debug;
use tiff::decoder::{ifd::Value, Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;
use tiff::ColorType;

use crate::coords::BBox;
use crate::error::{AquiferError, Result};
use crate::grid::GridSpec;
use crate::raster::Raster;

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GDAL_NODATA: u16 = 42113;

/// GeoKey directory: version 1.1.0, three keys.
///   GTModelType = Geographic, GTRasterType = PixelIsArea, GeographicType = WGS84.
const GEO_KEYS_WGS84: [u16; 16] = [
    1, 1, 0, 3,
    1024, 0, 1, 2,
    1025, 0, 1, 1,
    2048, 0, 1, 4326,
];

fn geo_tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

/// Read a single-band GeoTIFF, honouring an embedded GDAL nodata value.
pub fn read_geotiff(path: &Path) -> Result<Raster> {
    read_geotiff_with_nodata(path, None)
}

/// Read a single-band GeoTIFF. Cells equal to `nodata` (or to the file's own
/// GDAL nodata tag) become NaN. Paths ending in `.gz` are gunzipped first.
pub fn read_geotiff_with_nodata(path: &Path, nodata: Option<f32>) -> Result<Raster> {
    let bytes = read_bytes(path)?;
    let tiff_err = |e| AquiferError::tiff(path, e);

    let mut decoder = Decoder::new(io::Cursor::new(bytes)).map_err(tiff_err)?;
    let (width, height) = decoder.dimensions().map_err(tiff_err)?;
    match decoder.colortype().map_err(tiff_err)? {
        ColorType::Gray(_) => {}
        _ => return Err(AquiferError::UnsupportedPixelType(path.to_path_buf())),
    }

    let grid = read_grid(&mut decoder, width as usize, height as usize, path)?;
    let file_nodata = read_gdal_nodata(&mut decoder);

    let values: Vec<f32> = match decoder.read_image().map_err(tiff_err)? {
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        _ => return Err(AquiferError::UnsupportedPixelType(path.to_path_buf())),
    };

    if values.len() != grid.len() {
        return Err(AquiferError::ShapeMismatch { expected: grid.len(), actual: values.len() });
    }

    let is_nodata = |v: f32| {
        v.is_nan()
            || nodata.is_some_and(|n| v == n)
            || file_nodata.is_some_and(|n| v == n)
    };

    // Row reversal (TIFF N→S → Raster S→N).
    let w = grid.width;
    let mut data = Vec::with_capacity(grid.len());
    for tiff_row in (0..grid.height).rev() {
        for &v in &values[tiff_row * w..(tiff_row + 1) * w] {
            data.push(if is_nodata(v) { f32::NAN } else { v });
        }
    }

    debug!("read {} ({}x{})", path.display(), grid.width, grid.height);
    Raster::from_data(grid, data)
}

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    let file = fs::File::open(path).map_err(|e| AquiferError::io(path, e))?;
    let mut buf = Vec::new();
    let gz = path.extension().and_then(|e| e.to_str()) == Some("gz");
    let res = if gz {
        GzDecoder::new(file).read_to_end(&mut buf)
    } else {
        io::BufReader::new(file).read_to_end(&mut buf)
    };
    res.map_err(|e| AquiferError::io(path, e))?;
    Ok(buf)
}

fn find_f64s<R: Read + io::Seek>(decoder: &mut Decoder<R>, code: u16) -> Option<Vec<f64>> {
    let value = decoder.find_tag(geo_tag(code)).ok().flatten()?;
    value.into_f64_vec().ok()
}

fn read_grid<R: Read + io::Seek>(
    decoder: &mut Decoder<R>,
    width: usize,
    height: usize,
    path: &Path,
) -> Result<GridSpec> {
    let missing = || AquiferError::MissingGeoreference(path.to_path_buf());
    let scale = find_f64s(decoder, MODEL_PIXEL_SCALE).ok_or_else(missing)?;
    let tie = find_f64s(decoder, MODEL_TIEPOINT).ok_or_else(missing)?;
    if scale.len() < 2 || tie.len() < 6 {
        return Err(missing());
    }

    // Tiepoint (I, J, K) → (X, Y, Z): raster point (I, J) sits at model (X, Y).
    let (sx, sy) = (scale[0], scale[1]);
    let min_lon = tie[3] - tie[0] * sx;
    let max_lat = tie[4] + tie[1] * sy;
    let bbox = BBox::new(
        min_lon,
        min_lon + width as f64 * sx,
        max_lat - height as f64 * sy,
        max_lat,
    );
    GridSpec::new(width, height, bbox)
}

fn read_gdal_nodata<R: Read + io::Seek>(decoder: &mut Decoder<R>) -> Option<f32> {
    match decoder.find_tag(geo_tag(GDAL_NODATA)).ok().flatten()? {
        Value::Ascii(s) => s.trim_end_matches('\0').trim().parse().ok(),
        _ => None,
    }
}

/// Write a raster as a Float32 GeoTIFF in geographic WGS84 coordinates.
/// Nodata is written as NaN.
pub fn write_geotiff(path: &Path, raster: &Raster) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| AquiferError::io(parent, e))?;
        }
    }
    let tiff_err = |e| AquiferError::tiff(path, e);

    let grid = &raster.grid;
    let (dx, dy) = grid.cell_size();
    let w = grid.width;

    // Row reversal (Raster S→N → TIFF N→S).
    let mut north_up = Vec::with_capacity(grid.len());
    for row in (0..grid.height).rev() {
        north_up.extend_from_slice(&raster.data[row * w..(row + 1) * w]);
    }

    let file = fs::File::create(path).map_err(|e| AquiferError::io(path, e))?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file)).map_err(tiff_err)?;
    let mut image = encoder
        .new_image::<colortype::Gray32Float>(grid.width as u32, grid.height as u32)
        .map_err(tiff_err)?;

    let scale = [dx, dy, 0.0];
    let tie = [0.0, 0.0, 0.0, grid.bbox.min_lon, grid.bbox.max_lat, 0.0];
    let dir = image.encoder();
    dir.write_tag(geo_tag(MODEL_PIXEL_SCALE), &scale[..]).map_err(tiff_err)?;
    dir.write_tag(geo_tag(MODEL_TIEPOINT), &tie[..]).map_err(tiff_err)?;
    dir.write_tag(geo_tag(GEO_KEY_DIRECTORY), &GEO_KEYS_WGS84[..]).map_err(tiff_err)?;

    image.write_data(&north_up).map_err(tiff_err)?;
    debug!("wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn ramp() -> Raster {
        let grid = GridSpec::new(5, 3, BBox::new(84.0, 86.5, 19.0, 20.5)).unwrap();
        let mut r = Raster::new(grid, 0.0);
        for row in 0..3 {
            for col in 0..5 {
                r.set(row, col, (row * 10 + col) as f32);
            }
        }
        r.set(1, 1, f32::NAN);
        r
    }

    #[test]
    fn round_trip_preserves_grid_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ramp.tif");
        let r = ramp();
        write_geotiff(&path, &r).unwrap();

        let back = read_geotiff(&path).unwrap();
        assert!(back.grid.same_as(&r.grid, 1e-9));
        // Row 0 is still the southern row after the double flip.
        assert_eq!(back.get(0, 4), 4.0);
        assert_eq!(back.get(2, 0), 20.0);
        assert!(back.get(1, 1).is_nan());
    }

    #[test]
    fn nodata_sentinel_becomes_nan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.tif");
        let mut r = ramp();
        r.set(1, 1, -9999.0);
        write_geotiff(&path, &r).unwrap();

        let back = read_geotiff_with_nodata(&path, Some(-9999.0)).unwrap();
        assert!(back.get(1, 1).is_nan());
        assert_eq!(back.valid_count(), 14);
    }

    #[test]
    fn gzipped_files_are_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("ramp.tif");
        write_geotiff(&plain, &ramp()).unwrap();

        let gz_path = dir.path().join("ramp.tif.gz");
        let mut gz = flate2::write::GzEncoder::new(
            fs::File::create(&gz_path).unwrap(),
            flate2::Compression::default(),
        );
        gz.write_all(&fs::read(&plain).unwrap()).unwrap();
        gz.finish().unwrap();

        let back = read_geotiff(&gz_path).unwrap();
        assert_eq!(back.get(2, 4), 24.0);
    }

    #[test]
    fn byte_raster_honours_gdal_nodata_tag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classes.tif");
        {
            let file = fs::File::create(&path).unwrap();
            let mut enc = TiffEncoder::new(BufWriter::new(file)).unwrap();
            let mut image = enc.new_image::<colortype::Gray8>(3, 2).unwrap();
            let dir = image.encoder();
            dir.write_tag(geo_tag(MODEL_PIXEL_SCALE), &[1.0f64, 1.0, 0.0][..]).unwrap();
            dir.write_tag(geo_tag(MODEL_TIEPOINT), &[0.0f64, 0.0, 0.0, 84.0, 21.0, 0.0][..]).unwrap();
            dir.write_tag(geo_tag(GDAL_NODATA), "0").unwrap();
            // North row first.
            image.write_data(&[0u8, 5, 7, 9, 0, 11]).unwrap();
        }

        let back = read_geotiff(&path).unwrap();
        assert!(back.grid.same_as(&GridSpec::new(3, 2, BBox::new(84.0, 87.0, 19.0, 21.0)).unwrap(), 1e-9));
        assert_eq!(back.get(0, 0), 9.0);
        assert!(back.get(0, 1).is_nan());
        assert!(back.get(1, 0).is_nan());
        assert_eq!(back.get(1, 1), 5.0);
        assert_eq!(back.valid_count(), 4);
    }

    #[test]
    fn plain_tiff_without_georeference_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.tif");
        {
            let file = fs::File::create(&path).unwrap();
            let mut enc = TiffEncoder::new(BufWriter::new(file)).unwrap();
            enc.write_image::<colortype::Gray32Float>(2, 2, &[0.0f32; 4]).unwrap();
        }
        assert!(matches!(
            read_geotiff(&path),
            Err(AquiferError::MissingGeoreference(_))
        ));
    }
}
