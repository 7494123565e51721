//! # FITS image files
//!
//! Image HDUs of the Jacobian, probe, DM command and exposure files, read and
//! written with [fitsio].
//!
//! Array shapes follow the row-major convention of the files' producers:
//! the slowest varying axis comes first, i.e. `shape = [NAXISn, ..., NAXIS1]`.

use fitsio::{
    hdu::{FitsHdu, HduInfo},
    images::{ImageDescription, ImageType},
    FitsFile,
};
use std::{
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, thiserror::Error)]
pub enum FitsError {
    #[error("cfitsio error")]
    Fitsio(#[from] fitsio::errors::Error),
    #[error("failed to access FITS file")]
    Io(#[from] std::io::Error),
    #[error("HDU {0} of {1:?} is not an image")]
    NotAnImage(String, PathBuf),
    #[error("data length ({data}) does not match shape {shape:?}")]
    Shape { data: usize, shape: Vec<usize> },
}
pub type Result<T> = std::result::Result<T, FitsError>;

/// Header keyword value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Text(String),
}
impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(value) => Some(*value as f64),
            Value::Float(value) => Some(*value),
            _ => None,
        }
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }
}
impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}
impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::Integer(value as i64)
    }
}
impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}
impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}
impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

/// Ordered keyword/value metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    cards: Vec<(String, Value)>,
}
impl Header {
    pub fn new() -> Self {
        Default::default()
    }
    pub fn get(&self, key: &str) -> Option<&Value> {
        let key = key.to_uppercase();
        self.cards.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }
    /// Sets a keyword, replacing any previous value
    pub fn set<K: Into<String>, V: Into<Value>>(&mut self, key: K, value: V) {
        let key = key.into().to_uppercase();
        let value = value.into();
        match self.cards.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.cards.push((key, value)),
        }
    }
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.cards.iter().map(|(k, v)| (k.as_str(), v))
    }
    fn write(&self, file: &mut FitsFile, hdu: &FitsHdu) -> Result<()> {
        for (key, value) in self.iter().filter(|(key, _)| *key != "EXTNAME") {
            match value {
                Value::Integer(value) => hdu.write_key(file, key, *value)?,
                Value::Float(value) => hdu.write_key(file, key, *value)?,
                Value::Text(value) => hdu.write_key(file, key, value.clone())?,
            }
        }
        Ok(())
    }
}

/// Header/data unit holding an image
#[derive(Debug, Clone, PartialEq)]
pub struct Hdu {
    pub header: Header,
    name: Option<String>,
    shape: Vec<usize>,
    data: Vec<f64>,
}
impl Hdu {
    /// Creates an image HDU, `data` is in row-major order of `shape`
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        if shape.is_empty() || shape.iter().product::<usize>() != data.len() {
            return Err(FitsError::Shape {
                data: data.len(),
                shape,
            });
        }
        Ok(Self {
            header: Header::new(),
            name: None,
            shape,
            data,
        })
    }
    /// Creates a data-less HDU
    pub fn empty() -> Self {
        Self {
            header: Header::new(),
            name: None,
            shape: vec![],
            data: vec![],
        }
    }
    /// Sets the extension name
    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_uppercase());
        self
    }
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }
    pub fn data(&self) -> &[f64] {
        &self.data
    }
    fn description(&self) -> ImageDescription<'_> {
        ImageDescription {
            data_type: ImageType::Double,
            dimensions: &self.shape,
        }
    }
}

/// Image HDUs to be written to a FITS file
#[derive(Debug, Clone, PartialEq)]
pub struct HduList {
    primary: Hdu,
    extensions: Vec<Hdu>,
}
impl HduList {
    /// Creates a list with `primary` as the primary HDU
    pub fn new(primary: Hdu) -> Self {
        Self {
            primary,
            extensions: vec![],
        }
    }
    pub fn push(&mut self, hdu: Hdu) -> &mut Self {
        self.extensions.push(hdu);
        self
    }
    pub fn with(mut self, hdu: Hdu) -> Self {
        self.extensions.push(hdu);
        self
    }
    /// Writes the HDUs as 64-bit float images, replacing any existing file
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if path.exists() {
            fs::remove_file(path)?;
        }
        let mut file = if self.primary.shape.is_empty() {
            FitsFile::create(path).open()?
        } else {
            FitsFile::create(path)
                .with_custom_primary(&self.primary.description())
                .open()?
        };
        let primary = file.primary_hdu()?;
        if !self.primary.data.is_empty() {
            primary.write_image(&mut file, &self.primary.data)?;
        }
        self.primary.header.write(&mut file, &primary)?;
        for hdu in &self.extensions {
            let extension =
                file.create_image(hdu.name.clone().unwrap_or_default(), &hdu.description())?;
            extension.write_image(&mut file, &hdu.data)?;
            hdu.header.write(&mut file, &extension)?;
        }
        Ok(())
    }
}

/// Writes a single image to a FITS file
pub fn write_image<P: AsRef<Path>>(path: P, shape: Vec<usize>, data: Vec<f64>) -> Result<()> {
    HduList::new(Hdu::new(shape, data)?).write(path)
}

/// Read access to the image HDUs of a FITS file
pub struct FitsReader {
    path: PathBuf,
    file: FitsFile,
}
impl FitsReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = FitsFile::open(&path)?;
        Ok(Self { path, file })
    }
    /// Checks for an extension named `name` (case insensitive)
    pub fn has_extension(&mut self, name: &str) -> bool {
        self.file.hdu(name).is_ok()
    }
    /// Reads the primary image
    pub fn primary(&mut self) -> Result<Hdu> {
        let hdu = self.file.primary_hdu()?;
        self.read(hdu, "PRIMARY")
    }
    /// Reads the image of the extension `name`, `None` if there is no such extension
    pub fn extension(&mut self, name: &str) -> Result<Option<Hdu>> {
        if !self.has_extension(name) {
            return Ok(None);
        }
        let hdu = self.file.hdu(name)?;
        self.read(hdu, name).map(|hdu| Some(hdu.named(name)))
    }
    /// Numeric keyword of the primary header
    pub fn key_f64(&mut self, key: &str) -> Option<f64> {
        let hdu = self.file.primary_hdu().ok()?;
        hdu.read_key::<f64>(&mut self.file, key).ok()
    }
    /// Text keyword of the primary header
    pub fn key_str(&mut self, key: &str) -> Option<String> {
        let hdu = self.file.primary_hdu().ok()?;
        hdu.read_key::<String>(&mut self.file, key)
            .ok()
            .map(|value| value.trim().to_string())
    }
    fn read(&mut self, hdu: FitsHdu, name: &str) -> Result<Hdu> {
        let shape = match &hdu.info {
            HduInfo::ImageInfo { shape, .. } => shape.clone(),
            _ => return Err(FitsError::NotAnImage(name.into(), self.path.clone())),
        };
        if shape.is_empty() || shape.contains(&0) {
            return Ok(Hdu::empty());
        }
        let data: Vec<f64> = hdu.read_image(&mut self.file)?;
        Hdu::new(shape, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("strokemin-fits-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn extensions_by_name() {
        let path = scratch("probes.fits");
        let mut primary = Hdu::empty();
        primary.header.set("DZ_RIN", 5.5);
        primary.header.set("PROBEAMP", 20i64);
        primary.header.set("CRN_MODE", "lyot");
        let mask = Hdu::new(vec![2, 3], vec![0., 1., 1., 0., 0., 1.])
            .unwrap()
            .named("DARK_ZONE");
        HduList::new(primary).with(mask).write(&path).unwrap();

        let mut fits = FitsReader::open(&path).unwrap();
        assert!(fits.has_extension("DARK_ZONE"));
        assert!(fits.has_extension("dark_zone"));
        assert!(!fits.has_extension("DM_SETTINGS"));
        assert!(fits.extension("DM_SETTINGS").unwrap().is_none());
        assert!(fits.primary().unwrap().data().is_empty());
        assert_eq!(fits.key_f64("DZ_RIN"), Some(5.5));
        assert_eq!(fits.key_f64("PROBEAMP"), Some(20.));
        assert_eq!(fits.key_str("CRN_MODE").as_deref(), Some("lyot"));
        assert_eq!(fits.key_f64("DZ_ROUT"), None);
        let mask = fits.extension("DARK_ZONE").unwrap().unwrap();
        assert_eq!(mask.shape(), &[2, 3]);
        assert_eq!(mask.data(), &[0., 1., 1., 0., 0., 1.]);
    }

    #[test]
    fn overwrite() {
        let path = scratch("overwrite.fits");
        write_image(&path, vec![1, 2], vec![1., 2.]).unwrap();
        write_image(&path, vec![3], vec![3., 4., 5.]).unwrap();
        let image = FitsReader::open(&path).unwrap().primary().unwrap();
        assert_eq!(image.shape(), &[3]);
        assert_eq!(image.data(), &[3., 4., 5.]);
    }

    #[test]
    fn negative_axis_length() {
        let mut bytes = vec![];
        for line in [
            "SIMPLE  =                    T",
            "BITPIX  =                  -64",
            "NAXIS   =                    2",
            "NAXIS1  =                   -1",
            "NAXIS2  =                    2",
            "END",
        ] {
            bytes.extend(format!("{line:<80}").into_bytes());
        }
        bytes.resize(2 * 2880, b' ');
        let path = scratch("negative_naxis.fits");
        fs::write(&path, bytes).unwrap();
        let result = FitsReader::open(&path).and_then(|mut fits| fits.primary());
        assert!(result.is_err());
    }

    #[test]
    fn shape_mismatch() {
        assert!(matches!(
            Hdu::new(vec![2, 2], vec![0.; 3]),
            Err(FitsError::Shape { data: 3, .. })
        ));
    }
}
