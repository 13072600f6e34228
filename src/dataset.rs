use std::fs::{File, create_dir_all};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use burn::data::dataset::{
    Dataset, InMemDataset,
    transform::{Mapper, MapperDataset},
};
use flate2::read::GzDecoder;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

// GitHub mirror of the Zalando research dataset.
const URL: &str = "https://raw.githubusercontent.com/zalandoresearch/fashion-mnist/master/data/fashion/";
const TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
const TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
const TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
const TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

const WIDTH: usize = 28;
const HEIGHT: usize = 28;

/// Fashion-MNIST item.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FashionMnistItem {
    /// Image as a 2D array of floats.
    pub image: [[f32; WIDTH]; HEIGHT],

    /// Label of the image in [0, 9].
    pub label: u8,
}

#[derive(Deserialize, Debug, Clone)]
struct FashionMnistItemRaw {
    pub image_bytes: Vec<u8>,
    pub label: u8,
}

struct BytesToImage;

impl Mapper<FashionMnistItemRaw, FashionMnistItem> for BytesToImage {
    /// Convert a raw item (image bytes) to a usable item (2D array image).
    fn map(&self, item: &FashionMnistItemRaw) -> FashionMnistItem {
        debug_assert_eq!(item.image_bytes.len(), WIDTH * HEIGHT);

        let mut image_array = [[0f32; WIDTH]; HEIGHT];
        for (i, pixel) in item.image_bytes.iter().enumerate() {
            let x = i % WIDTH;
            let y = i / HEIGHT;
            image_array[y][x] = *pixel as f32;
        }

        FashionMnistItem {
            image: image_array,
            label: item.label,
        }
    }
}

type MappedDataset = MapperDataset<InMemDataset<FashionMnistItemRaw>, BytesToImage, FashionMnistItemRaw>;

/// The Fashion-MNIST dataset consists of 70,000 28x28 grayscale images of clothing articles in
/// 10 classes, with 7,000 images per class. There are 60,000 training images and 10,000 test
/// images, stored in the same IDX format as the original MNIST digits.
///
/// The data is downloaded from the web on first use and cached on disk afterwards.
pub struct FashionMnistDataset {
    dataset: MappedDataset,
}

impl Dataset<FashionMnistItem> for FashionMnistDataset {
    fn get(&self, index: usize) -> Option<FashionMnistItem> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

impl FashionMnistDataset {
    /// Creates a new train dataset.
    pub fn train() -> Self {
        Self::new("train")
    }

    /// Creates a new test dataset.
    pub fn test() -> Self {
        Self::new("test")
    }

    fn new(split: &str) -> Self {
        let root = FashionMnistDataset::download(split);

        // Fashion-MNIST is tiny so we can load it in-memory
        // Train images (u8): 28 * 28 * 60000 = 47.04Mb
        // Test images (u8): 28 * 28 * 10000 = 7.84Mb
        let images = FashionMnistDataset::read_images(&root, split);
        let labels = FashionMnistDataset::read_labels(&root, split);

        let items: Vec<_> = images
            .into_iter()
            .zip(labels)
            .map(|(image_bytes, label)| FashionMnistItemRaw { image_bytes, label })
            .collect();

        let dataset = InMemDataset::new(items);
        let dataset = MapperDataset::new(dataset, BytesToImage);

        Self { dataset }
    }

    /// Download the dataset files from the web if they are not cached already.
    /// Panics if the download cannot be completed or the content of the file cannot be written to disk.
    fn download(split: &str) -> PathBuf {
        // Dataset files are stored in the fashion-mnist-dataset cache directory
        let cache_dir = dirs::cache_dir()
            .expect("Could not get cache directory")
            .join("fashion-mnist-dataset");
        let split_dir = cache_dir.join(split);

        if !split_dir.exists() {
            create_dir_all(&split_dir).expect("Failed to create base directory");
        }

        match split {
            "train" => {
                FashionMnistDataset::download_file(TRAIN_IMAGES, &split_dir);
                FashionMnistDataset::download_file(TRAIN_LABELS, &split_dir);
            }
            "test" => {
                FashionMnistDataset::download_file(TEST_IMAGES, &split_dir);
                FashionMnistDataset::download_file(TEST_LABELS, &split_dir);
            }
            _ => panic!("Invalid split specified {split}"),
        };

        split_dir
    }

    /// Download a gzipped file from the dataset URL to the destination directory.
    /// File download progress is reported with the help of a [progress bar](indicatif).
    fn download_file<P: AsRef<Path>>(name: &str, dest_dir: &P) -> PathBuf {
        let file_name = dest_dir.as_ref().join(name);

        if !file_name.exists() {
            let bytes = download_file_as_bytes(&format!("{URL}{name}.gz"), name);

            let mut output_file = File::create(&file_name).expect("Failed to create output file");

            // Decode gzip file content and write to disk
            let mut gz_buffer = GzDecoder::new(&bytes[..]);
            std::io::copy(&mut gz_buffer, &mut output_file)
                .expect("Failed to decode and write file content");
        }

        file_name
    }

    /// Read images at the provided path for the specified split.
    /// Each image is a vector of bytes.
    fn read_images<P: AsRef<Path>>(root: &P, split: &str) -> Vec<Vec<u8>> {
        let file_name = if split == "train" {
            TRAIN_IMAGES
        } else {
            TEST_IMAGES
        };
        let file_name = root.as_ref().join(file_name);

        // Read number of images from 16-byte header metadata
        let mut f = File::open(file_name).expect("Should be able to open image file");
        let mut buf = [0u8; 4];
        let _ = f.seek(SeekFrom::Start(4)).unwrap();
        f.read_exact(&mut buf)
            .expect("Should be able to read image file header");
        let size = u32::from_be_bytes(buf);

        let mut buf_images: Vec<u8> = vec![0u8; WIDTH * HEIGHT * (size as usize)];
        let _ = f.seek(SeekFrom::Start(16)).unwrap();
        f.read_exact(&mut buf_images)
            .expect("Should be able to read image data");

        buf_images
            .chunks(WIDTH * HEIGHT)
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    /// Read labels at the provided path for the specified split.
    fn read_labels<P: AsRef<Path>>(root: &P, split: &str) -> Vec<u8> {
        let file_name = if split == "train" {
            TRAIN_LABELS
        } else {
            TEST_LABELS
        };
        let file_name = root.as_ref().join(file_name);

        // Read number of labels from 8-byte header metadata
        let mut f = File::open(file_name).expect("Should be able to open label file");
        let mut buf = [0u8; 4];
        let _ = f.seek(SeekFrom::Start(4)).unwrap();
        f.read_exact(&mut buf)
            .expect("Should be able to read label file header");
        let size = u32::from_be_bytes(buf);

        let mut buf_labels: Vec<u8> = vec![0u8; size as usize];
        let _ = f.seek(SeekFrom::Start(8)).unwrap();
        f.read_exact(&mut buf_labels)
            .expect("Should be able to read labels from file");

        buf_labels
    }
}

/// Download the file at the given url, reporting progress on the console.
/// Panics if the request fails or the body cannot be read.
fn download_file_as_bytes(url: &str, message: &str) -> Vec<u8> {
    let mut response = reqwest::blocking::get(url).expect("Should be able to download file");
    if !response.status().is_success() {
        panic!("Failed to download {url}: HTTP {}", response.status());
    }

    let total = response.content_length().unwrap_or(0);
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template(
            "{msg} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} ({eta})",
        )
        .expect("Progress bar template should be valid"),
    );
    bar.set_message(message.to_string());

    let mut bytes = Vec::with_capacity(total as usize);
    let mut buf = [0u8; 32 * 1024];
    loop {
        let n = response
            .read(&mut buf)
            .expect("Should be able to read response body");
        if n == 0 {
            break;
        }
        bytes.extend_from_slice(&buf[..n]);
        bar.inc(n as u64);
    }
    bar.finish();

    bytes
}
