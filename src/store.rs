use crate::{error::Error, filter::FeatureVector};
use ndarray::{Array2, ArrayD};
use ndarray_npy::{ReadNpyError, WriteNpyExt};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    fs::{self, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, info, warn};

const RECORD_PREFIX: &str = "tensor_data";
const RECORD_EXTENSION: &str = "npy";

/// The identity of a class directory in the corpus.
///
/// Directories named with a non-negative integer are class indices; anything
/// else is kept verbatim. Indices sort first, numerically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub(crate) enum Label {
    Index(u32),
    Name(String),
}

impl FromStr for Label {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.contains(std::path::is_separator) || s == "." || s == ".." {
            return Err(Error::InvalidLabel(s.to_owned()));
        }
        Ok(s.parse::<u32>()
            .map(Label::Index)
            .unwrap_or_else(|_| Label::Name(s.to_owned())))
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "{}", index),
            Self::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LabeledSample {
    pub(crate) feature: FeatureVector,
    pub(crate) label: Label,
}

/// Samples grouped by label, each group in record order.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Corpus {
    pub(crate) classes: BTreeMap<Label, Vec<FeatureVector>>,
}

impl Corpus {
    pub(crate) fn len(&self) -> usize {
        self.classes.values().map(Vec::len).sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn labels(&self) -> impl Iterator<Item = &Label> {
        self.classes.keys()
    }

    /// Every sample in label order, then record order.
    pub(crate) fn samples(&self) -> impl Iterator<Item = (&Label, &FeatureVector)> {
        self.classes
            .iter()
            .flat_map(|(label, features)| features.iter().map(move |feature| (label, feature)))
    }

    #[cfg(test)]
    pub(crate) fn push(&mut self, sample: LabeledSample) {
        self.classes
            .entry(sample.label)
            .or_insert_with(Vec::new)
            .push(sample.feature);
    }
}

#[derive(Debug, Default)]
pub(crate) struct LoadedCorpus {
    pub(crate) corpus: Corpus,
    /// Records that existed but could not be read.
    pub(crate) skipped: usize,
}

/// Append-only sample storage: one directory per label, one `.npy` per sample.
#[derive(Debug)]
pub(crate) struct FeatureStore {
    root: PathBuf,
    next_counter: HashMap<Label, u64>,
}

impl FeatureStore {
    pub(crate) fn open<P>(root: P) -> Result<Self, Error>
    where
        P: Into<PathBuf>,
    {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::CreateCorpusDir(e, root.clone()))?;
        Ok(Self {
            root,
            next_counter: HashMap::new(),
        })
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    /// Write `sample` as a fresh record under its label and return the path.
    pub(crate) fn append(&mut self, sample: &LabeledSample) -> Result<PathBuf, Error> {
        let dir = self.root.join(sample.label.to_string());
        fs::create_dir_all(&dir).map_err(|e| Error::CreateCorpusDir(e, dir.clone()))?;

        let mut counter = match self.next_counter.get(&sample.label) {
            Some(&counter) => counter,
            None => next_free_counter(&dir)?,
        };

        let record = sample.feature.to_record();
        loop {
            let path = dir.join(record_name(counter));
            counter += 1;

            let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                // someone else took this counter, move past it
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(Error::WriteSample(e, path)),
            };

            write_record(&path, BufWriter::new(file), &record)?;
            self.next_counter.insert(sample.label.clone(), counter);

            debug!(message = "appended sample", path = %path.display());
            return Ok(path);
        }
    }
}

/// Encode `record` into `writer`, removing the half-written file at `path`
/// when that fails.
fn write_record<W>(path: &Path, mut writer: W, record: &Array2<f64>) -> Result<(), Error>
where
    W: Write,
{
    let result = record
        .write_npy(&mut writer)
        .map_err(|e| Error::EncodeSample(e, path.to_path_buf()))
        .and_then(|()| {
            writer
                .flush()
                .map_err(|e| Error::WriteSample(e, path.to_path_buf()))
        });
    drop(writer);

    if result.is_err() {
        if let Err(e) = fs::remove_file(path) {
            warn!(message = "failed to remove partial sample", path = %path.display(), error = %e);
        }
    }
    result
}

fn record_name(counter: u64) -> String {
    format!("{}{}.{}", RECORD_PREFIX, counter, RECORD_EXTENSION)
}

/// Parse the counter out of a record file name, e.g. `tensor_data12.npy` -> 12.
fn record_counter(path: &Path) -> Option<u64> {
    if path.extension()? != RECORD_EXTENSION {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(RECORD_PREFIX)?
        .parse()
        .ok()
}

fn next_free_counter(dir: &Path) -> Result<u64, Error> {
    Ok(list_records(dir)?
        .iter()
        .filter_map(|path| record_counter(path))
        .max()
        .map_or(1, |max| max + 1))
}

/// `.npy` files in `dir`, counter-numbered records first in counter order,
/// then any others by name.
fn list_records(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut records = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| Error::ReadCorpusDir(e, dir.to_path_buf()))? {
        let path = entry
            .map_err(|e| Error::ReadCorpusDir(e, dir.to_path_buf()))?
            .path();
        if path.is_file() && path.extension().map_or(false, |ext| ext == RECORD_EXTENSION) {
            records.push(path);
        }
    }
    records.sort_by(|a, b| {
        (record_counter(a).is_none(), record_counter(a), a)
            .cmp(&(record_counter(b).is_none(), record_counter(b), b))
    });
    Ok(records)
}

/// Read one record, accepting either float64 (numpy's default) or float32 data
/// holding 34 values.
pub(crate) fn read_sample(path: &Path) -> Result<FeatureVector, Error> {
    let array = match ndarray_npy::read_npy::<_, ArrayD<f64>>(path) {
        Ok(array) => array,
        Err(ReadNpyError::WrongDescriptor(_)) => ndarray_npy::read_npy::<_, ArrayD<f32>>(path)
            .map_err(|e| Error::ReadSample(e, path.to_path_buf()))?
            .mapv(f64::from),
        Err(e) => return Err(Error::ReadSample(e, path.to_path_buf())),
    };

    if array.len() != crate::filter::FEATURE_WIDTH {
        return Err(Error::RecordShape(array.shape().to_vec()));
    }
    let record = array
        .into_shape((2, crate::pose::NUM_KEYPOINTS))
        .map_err(Error::ReshapeRecord)?;
    FeatureVector::from_record(record.view())
}

/// Load every label directory under `root`.
///
/// A record that fails to parse is logged and counted in
/// [`LoadedCorpus::skipped`]; a directory that cannot be listed is an error.
pub(crate) fn load_corpus<P>(root: P) -> Result<LoadedCorpus, Error>
where
    P: AsRef<Path>,
{
    let root = root.as_ref();
    let mut loaded = LoadedCorpus::default();

    for entry in fs::read_dir(root).map_err(|e| Error::ReadCorpusDir(e, root.to_path_buf()))? {
        let dir = entry
            .map_err(|e| Error::ReadCorpusDir(e, root.to_path_buf()))?
            .path();
        if !dir.is_dir() {
            continue;
        }

        let name = dir
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| Error::LabelDirName(dir.clone()))?;
        let label = name.parse::<Label>()?;

        let features = loaded.corpus.classes.entry(label.clone()).or_insert_with(Vec::new);
        for path in list_records(&dir)? {
            match read_sample(&path) {
                Ok(feature) => features.push(feature),
                Err(error) => {
                    warn!(
                        message = "skipping unreadable corpus record",
                        path = %path.display(),
                        %error
                    );
                    loaded.skipped += 1;
                }
            }
        }

        info!(
            message = "loaded class",
            label = %label,
            samples = features.len()
        );
    }

    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{filter::KeypointFilter, pose::tests::uniform_person};

    fn sample(label: &str, x: f32) -> LabeledSample {
        let mut feature = KeypointFilter::default().filter(&[uniform_person(0.9, 0.9)])[0];
        feature.xs[0] = x;
        LabeledSample {
            feature,
            label: label.parse().unwrap(),
        }
    }

    mod label_tests {
        use super::*;

        #[test]
        fn numeric_names_are_indices() {
            assert_eq!("2".parse::<Label>().unwrap(), Label::Index(2));
            assert_eq!(
                "fall".parse::<Label>().unwrap(),
                Label::Name("fall".to_owned())
            );
        }

        #[test]
        fn indices_sort_numerically_before_names() {
            let mut labels = vec![
                "walk".parse::<Label>().unwrap(),
                "10".parse().unwrap(),
                "2".parse().unwrap(),
            ];
            labels.sort();
            assert_eq!(
                labels,
                vec![
                    Label::Index(2),
                    Label::Index(10),
                    Label::Name("walk".to_owned())
                ]
            );
        }

        #[test]
        fn path_like_names_are_rejected() {
            assert!("".parse::<Label>().is_err());
            assert!("..".parse::<Label>().is_err());
            assert!("a/b".parse::<Label>().is_err());
        }
    }

    mod append_tests {
        use super::*;

        #[test]
        fn counters_increase_per_label() {
            let dir = tempfile::tempdir().unwrap();
            let mut store = FeatureStore::open(dir.path()).unwrap();

            let a = store.append(&sample("0", 0.1)).unwrap();
            let b = store.append(&sample("0", 0.2)).unwrap();
            let c = store.append(&sample("1", 0.3)).unwrap();

            assert_eq!(a, dir.path().join("0").join("tensor_data1.npy"));
            assert_eq!(b, dir.path().join("0").join("tensor_data2.npy"));
            assert_eq!(c, dir.path().join("1").join("tensor_data1.npy"));
        }

        #[test]
        fn reopening_never_overwrites() {
            let dir = tempfile::tempdir().unwrap();
            let first = FeatureStore::open(dir.path())
                .unwrap()
                .append(&sample("0", 0.1))
                .unwrap();
            let second = FeatureStore::open(dir.path())
                .unwrap()
                .append(&sample("0", 0.2))
                .unwrap();
            assert_ne!(first, second);

            let loaded = load_corpus(dir.path()).unwrap();
            let xs = loaded.corpus.classes[&Label::Index(0)]
                .iter()
                .map(|f| f.xs[0])
                .collect::<Vec<_>>();
            assert_eq!(xs, vec![0.1, 0.2]);
        }

        #[test]
        fn skips_past_foreign_files() {
            let dir = tempfile::tempdir().unwrap();
            let class_dir = dir.path().join("0");
            fs::create_dir_all(&class_dir).unwrap();
            fs::write(class_dir.join("tensor_data1785.npy"), b"junk").unwrap();

            let path = FeatureStore::open(dir.path())
                .unwrap()
                .append(&sample("0", 0.1))
                .unwrap();
            assert_eq!(path, class_dir.join("tensor_data1786.npy"));
        }

        /// Accepts bytes until `flush`, or fails every write.
        struct Broken {
            fail_writes: bool,
        }

        impl Write for Broken {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                if self.fail_writes {
                    Err(io::Error::new(io::ErrorKind::Other, "disk full"))
                } else {
                    Ok(buf.len())
                }
            }

            fn flush(&mut self) -> io::Result<()> {
                Err(io::Error::new(io::ErrorKind::Other, "disk full"))
            }
        }

        #[test]
        fn failed_write_leaves_no_record() {
            let dir = tempfile::tempdir().unwrap();
            let class_dir = dir.path().join("0");
            fs::create_dir_all(&class_dir).unwrap();
            let record = sample("0", 0.1).feature.to_record();

            let path = class_dir.join(record_name(1));
            fs::write(&path, b"").unwrap();
            let err = write_record(&path, Broken { fail_writes: true }, &record).unwrap_err();
            assert!(matches!(err, Error::EncodeSample(..)));
            assert!(!path.exists());

            let path = class_dir.join(record_name(2));
            fs::write(&path, b"").unwrap();
            let err = write_record(&path, Broken { fail_writes: false }, &record).unwrap_err();
            assert!(matches!(err, Error::WriteSample(..) | Error::EncodeSample(..)));
            assert!(!path.exists());

            let loaded = load_corpus(dir.path()).unwrap();
            assert_eq!(loaded.skipped, 0);
            assert!(loaded.corpus.is_empty());
        }
    }

    mod load_corpus_tests {
        use super::*;

        #[test]
        fn round_trips_samples_by_label() {
            let dir = tempfile::tempdir().unwrap();
            let mut store = FeatureStore::open(dir.path()).unwrap();
            for i in 0..3 {
                store.append(&sample("0", 0.1 * i as f32)).unwrap();
            }
            store.append(&sample("2", 0.5)).unwrap();
            store.append(&sample("walk", 0.7)).unwrap();

            let loaded = load_corpus(dir.path()).unwrap();
            assert_eq!(loaded.skipped, 0);
            assert_eq!(loaded.corpus.len(), 5);
            assert_eq!(
                loaded.corpus.labels().cloned().collect::<Vec<_>>(),
                vec![
                    Label::Index(0),
                    Label::Index(2),
                    Label::Name("walk".to_owned())
                ]
            );
            assert_eq!(loaded.corpus.classes[&Label::Index(2)][0], sample("2", 0.5).feature);
        }

        #[test]
        fn corrupt_records_are_counted_and_skipped() {
            let dir = tempfile::tempdir().unwrap();
            let mut store = FeatureStore::open(dir.path()).unwrap();
            store.append(&sample("1", 0.1)).unwrap();
            fs::write(dir.path().join("1").join("tensor_data9.npy"), b"not an array").unwrap();
            fs::write(dir.path().join("1").join("notes.txt"), b"ignored").unwrap();

            let loaded = load_corpus(dir.path()).unwrap();
            assert_eq!(loaded.skipped, 1);
            assert_eq!(loaded.corpus.len(), 1);
        }

        #[test]
        fn reads_numpy_float32_flat_records() {
            let dir = tempfile::tempdir().unwrap();
            let class_dir = dir.path().join("0");
            fs::create_dir_all(&class_dir).unwrap();
            let flat = ndarray::Array1::<f32>::from_elem(crate::filter::FEATURE_WIDTH, 0.25);
            ndarray_npy::write_npy(class_dir.join("tensor_data1.npy"), &flat).unwrap();

            let loaded = load_corpus(dir.path()).unwrap();
            assert_eq!(loaded.skipped, 0);
            let feature = loaded.corpus.classes[&Label::Index(0)][0];
            assert!(feature.xs.iter().chain(&feature.ys).all(|&v| v == 0.25));
        }

        #[test]
        fn missing_root_is_an_error() {
            let dir = tempfile::tempdir().unwrap();
            assert!(matches!(
                load_corpus(dir.path().join("absent")),
                Err(Error::ReadCorpusDir(_, _))
            ));
        }
    }
}
