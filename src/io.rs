use anyhow::{bail, Result};
use burn::{
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder},
};
use npyz::{npz, NpyFile};
use regex::Regex;
use reqwest::IntoUrl;
use std::{
    fs::{self, File},
    io::{self, Read},
    path::Path,
};
use zip::ZipArchive;

/// Loads images of equal size as `[B, 3, H, W]` in `[0, 1]`.
pub fn load_images<B: Backend, P: AsRef<Path>>(
    file_paths: &[P],
    device: &B::Device,
) -> Result<Tensor<B, 4>> {
    let mut size = None;
    let mut values = Vec::new();
    for file_path in file_paths {
        let image = image::open(file_path)?.to_rgb32f();
        let dimensions = [image.height() as usize, image.width() as usize];
        match size {
            None => size = Some(dimensions),
            Some(size) if size != dimensions => bail!(
                "Image {} has size {:?}, expected {:?}",
                file_path.as_ref().display(),
                dimensions,
                size
            ),
            _ => {}
        }
        values.extend(image.into_raw());
    }

    let Some([height, width]) = size else {
        bail!("No image to load");
    };
    let images = Tensor::<B, 4>::from_data(
        TensorData::new(values, [file_paths.len(), height, width, 3]),
        device,
    );

    Ok(images.permute([0, 3, 1, 2]))
}

/// Loads a prior from `.npy` data.
///
/// Arrays of `[H, W]`, `[B, H, W]` and `[B, C, H, W]` become `[B, C, H, W]`.
pub fn load_prior<B: Backend, R: Read>(
    mut reader: R,
    device: &B::Device,
) -> Result<Tensor<B, 4>> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;

    let array = NpyFile::new(bytes.as_slice())?;
    let shape = array
        .shape()
        .iter()
        .map(|&size| size as usize)
        .collect::<Vec<_>>();
    let values = match array.into_vec::<f32>() {
        Ok(values) => values,
        Err(_) => NpyFile::new(bytes.as_slice())?
            .into_vec::<f64>()?
            .into_iter()
            .map(|value| value as f32)
            .collect(),
    };

    let shape = match shape.as_slice() {
        &[height, width] => [1, 1, height, width],
        &[batch, height, width] => [batch, 1, height, width],
        &[batch, channels, height, width] => [batch, channels, height, width],
        _ => bail!("Unsupported prior shape {:?}", shape),
    };

    Ok(Tensor::from_data(TensorData::new(values, shape), device))
}

pub fn load_prior_from_file_path<B: Backend>(
    file_path: impl AsRef<Path>,
    device: &B::Device,
) -> Result<Tensor<B, 4>> {
    load_prior(io::BufReader::new(File::open(file_path)?), device)
}

/// Loads the prior named `array_name` from an `.npz` archive.
pub fn load_prior_npz<B: Backend, R: io::Read + io::Seek>(
    reader: R,
    array_name: &str,
    device: &B::Device,
) -> Result<Tensor<B, 4>> {
    let mut archive = ZipArchive::new(reader)?;
    let entry = archive.by_name(&npz::file_name_from_array_name(array_name))?;

    load_prior(io::BufReader::new(entry), device)
}

pub fn read_bytes_from_url(url: impl IntoUrl) -> Result<Vec<u8>> {
    Ok(reqwest::blocking::get(url)?
        .error_for_status()?
        .bytes()?
        .to_vec())
}

pub fn read_bytes_from_file_path_or_url(
    file_path_or_url: &str,
) -> Result<Vec<u8>> {
    if Regex::new(r"^https?://")?.is_match(file_path_or_url) {
        read_bytes_from_url(file_path_or_url)
    } else {
        Ok(fs::read(file_path_or_url)?)
    }
}

/// Loads a named MessagePack record from a file path or URL into `module`.
pub fn load_record<B: Backend, M: Module<B>>(
    module: M,
    file_path_or_url: &str,
    device: &B::Device,
) -> Result<M> {
    let bytes = read_bytes_from_file_path_or_url(file_path_or_url)?;
    let recorder = NamedMpkBytesRecorder::<FullPrecisionSettings>::new();
    let record = Recorder::<B>::load(&recorder, bytes, device)?;

    Ok(module.load_record(record))
}

/// Saves `module` as a named MessagePack record readable by [`load_record`].
pub fn save_record<B: Backend, M: Module<B>>(
    module: M,
    file_path: impl AsRef<Path>,
) -> Result<()> {
    let recorder = NamedMpkBytesRecorder::<FullPrecisionSettings>::new();
    let bytes = Recorder::<B>::record(&recorder, module.into_record(), ())?;
    fs::write(file_path, bytes)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{io::Write, path::PathBuf};

    type Backend = burn::backend::NdArray;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("pixel-sdf-{}-{name}", std::process::id()))
    }

    fn npy_bytes(shape: &str, values: &[f32]) -> Vec<u8> {
        let mut header = format!(
            "{{'descr': '<f4', 'fortran_order': False, 'shape': {shape}, }}"
        );
        while (10 + header.len() + 1) % 64 != 0 {
            header.push(' ');
        }
        header.push('\n');

        let mut bytes = b"\x93NUMPY\x01\x00".to_vec();
        bytes.extend((header.len() as u16).to_le_bytes());
        bytes.extend(header.as_bytes());
        for value in values {
            bytes.extend(value.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn load_images_from_png() {
        let device = Default::default();
        let file_path = temp_path("image.png");
        let mut image = image::RgbImage::new(3, 2);
        image.put_pixel(0, 0, image::Rgb([255, 0, 51]));
        image.put_pixel(2, 1, image::Rgb([0, 255, 102]));
        image.save(&file_path).unwrap();

        let images = load_images::<Backend, _>(
            &[file_path.clone(), file_path.clone()],
            &device,
        );
        fs::remove_file(&file_path).unwrap();

        let images = images.unwrap();
        assert_eq!(images.dims(), [2, 3, 2, 3]);
        let values = images.into_data().to_vec::<f32>().unwrap();
        assert!((values[0] - 1.0).abs() < 1e-6);
        assert!(values[6].abs() < 1e-6);
        assert!((values[12] - 0.2).abs() < 1e-6);
        assert!((values[11] - 1.0).abs() < 1e-6);
        assert!((values[17] - 0.4).abs() < 1e-6);

        assert!(load_images::<Backend, PathBuf>(&[], &device).is_err());
    }

    #[test]
    fn load_prior_from_npy() {
        let device = Default::default();

        let bytes = npy_bytes("(2, 3)", &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let prior = load_prior::<Backend, _>(bytes.as_slice(), &device).unwrap();
        assert_eq!(prior.dims(), [1, 1, 2, 3]);
        assert_eq!(
            prior.into_data().to_vec::<f32>().unwrap(),
            vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]
        );

        let bytes = npy_bytes("(2, 1, 2)", &[0.5; 4]);
        let prior = load_prior::<Backend, _>(bytes.as_slice(), &device).unwrap();
        assert_eq!(prior.dims(), [2, 1, 1, 2]);

        let bytes = npy_bytes("(4,)", &[0.5; 4]);
        assert!(load_prior::<Backend, _>(bytes.as_slice(), &device).is_err());
    }

    #[test]
    fn load_prior_from_npz() {
        let device = Default::default();
        let mut writer = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
        writer
            .start_file(
                "depth.npy",
                zip::write::SimpleFileOptions::default()
                    .compression_method(zip::CompressionMethod::Stored),
            )
            .unwrap();
        writer
            .write_all(&npy_bytes("(1, 1, 2, 2)", &[1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        let archive = writer.finish().unwrap();

        let prior = load_prior_npz::<Backend, _>(
            io::Cursor::new(archive.into_inner()),
            "depth",
            &device,
        )
        .unwrap();
        assert_eq!(prior.dims(), [1, 1, 2, 2]);
        assert_eq!(
            prior.into_data().to_vec::<f32>().unwrap(),
            vec![1.0, 2.0, 3.0, 4.0]
        );
    }

    #[test]
    fn read_bytes_from_missing_file_fails() {
        assert!(read_bytes_from_file_path_or_url(
            "/nonexistent/pixel-sdf/record.mpk"
        )
        .is_err());
    }
}
