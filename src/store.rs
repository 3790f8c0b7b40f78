//! Disk-backed shared namespace.
//!
//! A namespace is a directory. Every entry is one file or sub-directory named
//! `<tag>:<key>:<variant>`, where `tag` is `int`, `str` or `bool` and
//! `variant` is `p` (bincode record), `a` (memory-mapped array) or `d`
//! (nested namespace). Any thread or process that attaches the same path sees
//! the same contents, which is how workers and the orchestrator exchange
//! buffers without copies.
//!
//! The in-memory [`Namespace`] only indexes entries. Array memory is owned by
//! the [`SharedArray`], [`SharedArrayMut`] and [`StripedArray`] handles.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use bytemuck::Pod;
use log::{debug, error};
use memmap2::{Mmap, MmapMut, MmapOptions};
use ndarray::{ArrayBase, ArrayViewD, ArrayViewMutD, Data, Dimension, IxDyn};
use num_complex::Complex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;
use crate::jones::Jones;

pub const ARRAY_MAGIC: &[u8; 8] = b"FSTARRAY";
pub const HEADER_LEN: usize = 64;
pub const MAX_DIMS: usize = 6;
const TMP_PREFIX: &str = ".tmp.";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Int(i64),
    Str(String),
    Bool(bool),
}

impl Key {
    fn tag(&self) -> &'static str {
        match self {
            Key::Int(_) => "int",
            Key::Str(_) => "str",
            Key::Bool(_) => "bool",
        }
    }

    fn validate(&self) -> Result<(), StoreError> {
        if let Key::Str(s) = self {
            if s.is_empty() || s.contains('/') || s.contains('\0') {
                return Err(StoreError::UnsupportedKey(s.clone()));
            }
        }
        Ok(())
    }

    fn entry_name(&self, variant: Variant) -> Result<String, StoreError> {
        self.validate()?;
        Ok(format!("{}:{}:{}", self.tag(), self, variant.tag()))
    }

    /// Parses `<tag>:<key>:<variant>`. The key text may itself contain ':'.
    pub fn parse_entry(name: &str) -> Option<(Key, Variant)> {
        let (tag, rest) = name.split_once(':')?;
        let (value, variant) = rest.rsplit_once(':')?;
        let variant = match variant {
            "p" => Variant::Record,
            "a" => Variant::Array,
            "d" => Variant::Namespace,
            _ => return None,
        };
        let key = match tag {
            "int" => Key::Int(value.parse().ok()?),
            "str" if !value.is_empty() => Key::Str(value.to_string()),
            "bool" => match value {
                "true" => Key::Bool(true),
                "false" => Key::Bool(false),
                _ => return None,
            },
            _ => return None,
        };
        Some((key, variant))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(v) => write!(f, "{v}"),
            Key::Str(v) => write!(f, "{v}"),
            Key::Bool(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Int(v)
    }
}

impl From<usize> for Key {
    fn from(v: usize) -> Self {
        Key::Int(v as i64)
    }
}

impl From<bool> for Key {
    fn from(v: bool) -> Self {
        Key::Bool(v)
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::Str(v.to_string())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::Str(v)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Variant {
    Record,
    Array,
    Namespace,
}

impl Variant {
    fn tag(self) -> char {
        match self {
            Variant::Record => 'p',
            Variant::Array => 'a',
            Variant::Namespace => 'd',
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Variant::Record => "record",
            Variant::Array => "array",
            Variant::Namespace => "namespace",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DType {
    U8,
    I32,
    I64,
    F32,
    F64,
    C32,
    C64,
    Jones,
}

impl DType {
    fn code(self) -> u32 {
        match self {
            DType::U8 => 1,
            DType::I32 => 2,
            DType::I64 => 3,
            DType::F32 => 4,
            DType::F64 => 5,
            DType::C32 => 6,
            DType::C64 => 7,
            DType::Jones => 8,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => DType::U8,
            2 => DType::I32,
            3 => DType::I64,
            4 => DType::F32,
            5 => DType::F64,
            6 => DType::C32,
            7 => DType::C64,
            8 => DType::Jones,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::U8 => "u8",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::C32 => "complex64",
            DType::C64 => "complex128",
            DType::Jones => "jones",
        }
    }

    pub fn size(self) -> usize {
        match self {
            DType::U8 => 1,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 | DType::C32 => 8,
            DType::C64 => 16,
            DType::Jones => 32,
        }
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Plain-old-data element types that can live in a shared array.
pub trait Element: Pod + sealed::Sealed {
    const DTYPE: DType;
}

macro_rules! element {
    ($ty:ty, $dtype:expr) => {
        impl sealed::Sealed for $ty {}
        impl Element for $ty {
            const DTYPE: DType = $dtype;
        }
    };
}

element!(u8, DType::U8);
element!(i32, DType::I32);
element!(i64, DType::I64);
element!(f32, DType::F32);
element!(f64, DType::F64);
element!(Complex<f32>, DType::C32);
element!(Complex<f64>, DType::C64);
element!(Jones, DType::Jones);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArrayMeta {
    pub path: PathBuf,
    pub dtype: DType,
    pub shape: Vec<usize>,
}

impl ArrayMeta {
    fn n_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Clone, Debug)]
enum Entry {
    Record(PathBuf),
    Array(ArrayMeta),
    Namespace(PathBuf),
}

impl Entry {
    fn variant(&self) -> Variant {
        match self {
            Entry::Record(_) => Variant::Record,
            Entry::Array(_) => Variant::Array,
            Entry::Namespace(_) => Variant::Namespace,
        }
    }

    fn path(&self) -> &Path {
        match self {
            Entry::Record(p) | Entry::Namespace(p) => p,
            Entry::Array(meta) => &meta.path,
        }
    }
}

/// Root directory for store namespaces: `/dev/shm/<name>` when a tmpfs is
/// available, otherwise under the system temp dir.
pub fn default_root(name: &str) -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.join(name)
    } else {
        std::env::temp_dir().join(name)
    }
}

#[derive(Debug)]
pub struct Namespace {
    path: PathBuf,
    read_only: bool,
    entries: BTreeMap<Key, Entry>,
}

impl Namespace {
    /// Creates a fresh namespace, wiping whatever existed at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            fs::remove_dir_all(&path).map_err(|e| StoreError::io(&path, e))?;
        }
        fs::create_dir_all(&path).map_err(|e| StoreError::io(&path, e))?;
        Ok(Namespace {
            path,
            read_only: false,
            entries: BTreeMap::new(),
        })
    }

    /// Opens an existing namespace without clearing it.
    pub fn attach(path: impl AsRef<Path>, read_only: bool) -> Result<Self, StoreError> {
        let mut ns = Namespace {
            path: path.as_ref().to_path_buf(),
            read_only,
            entries: BTreeMap::new(),
        };
        ns.reload()?;
        Ok(ns)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Rebuilds the index from the directory. Entries whose names or headers
    /// are malformed are logged and skipped.
    pub fn reload(&mut self) -> Result<(), StoreError> {
        self.entries.clear();
        let dir = fs::read_dir(&self.path).map_err(|e| StoreError::io(&self.path, e))?;
        for item in dir {
            let item = item.map_err(|e| StoreError::io(&self.path, e))?;
            let entry_path = item.path();
            let name = item.file_name().to_string_lossy().into_owned();
            if name.starts_with(TMP_PREFIX) {
                debug!("skipping in-flight store file {}", entry_path.display());
                continue;
            }
            match Self::index_entry(&entry_path, &name) {
                Ok((key, entry)) => {
                    self.entries.insert(key, entry);
                }
                Err(err) => error!("{err}; entry skipped"),
            }
        }
        Ok(())
    }

    fn index_entry(path: &Path, name: &str) -> Result<(Key, Entry), StoreError> {
        let corrupt = |reason: &str| StoreError::CorruptEntry {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        let (key, variant) =
            Key::parse_entry(name).ok_or_else(|| corrupt("name does not match <type>:<key>:<p|a|d>"))?;
        let entry = match variant {
            Variant::Record if path.is_file() => Entry::Record(path.to_path_buf()),
            Variant::Namespace if path.is_dir() => Entry::Namespace(path.to_path_buf()),
            Variant::Array if path.is_file() => Entry::Array(read_array_header(path)?),
            _ => return Err(corrupt("entry kind does not match its variant tag")),
        };
        Ok((key, entry))
    }

    fn ensure_writable(&self) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly(self.path.clone()));
        }
        Ok(())
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: impl Into<Key>) -> bool {
        self.entries.contains_key(&key.into())
    }

    pub fn variant_of(&self, key: impl Into<Key>) -> Option<Variant> {
        self.entries.get(&key.into()).map(Entry::variant)
    }

    /// Removes an entry and its backing file or directory.
    pub fn remove(&mut self, key: impl Into<Key>) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let key = key.into();
        if let Some(entry) = self.entries.remove(&key) {
            remove_path(entry.path())?;
        }
        Ok(())
    }

    fn replace_slot(&mut self, key: &Key) -> Result<(), StoreError> {
        if let Some(entry) = self.entries.remove(key) {
            remove_path(entry.path())?;
        }
        Ok(())
    }

    pub fn put_record<T: Serialize>(
        &mut self,
        key: impl Into<Key>,
        value: &T,
    ) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let key = key.into();
        let name = key.entry_name(Variant::Record)?;
        let bytes = bincode::serialize(value)?;
        self.replace_slot(&key)?;
        let final_path = self.path.join(&name);
        let tmp_path = self.path.join(format!("{TMP_PREFIX}{name}"));
        {
            let mut file = File::create(&tmp_path).map_err(|e| StoreError::io(&tmp_path, e))?;
            file.write_all(&bytes)
                .map_err(|e| StoreError::io(&tmp_path, e))?;
        }
        fs::rename(&tmp_path, &final_path).map_err(|e| StoreError::io(&final_path, e))?;
        self.entries.insert(key, Entry::Record(final_path));
        Ok(())
    }

    pub fn get_record<T: DeserializeOwned>(&self, key: impl Into<Key>) -> Result<T, StoreError> {
        let key = key.into();
        match self.lookup(&key)? {
            Entry::Record(path) => {
                let mut bytes = Vec::new();
                File::open(path)
                    .and_then(|mut f| f.read_to_end(&mut bytes))
                    .map_err(|e| StoreError::io(path, e))?;
                Ok(bincode::deserialize(&bytes)?)
            }
            other => Err(wrong_kind(&key, Variant::Record, other.variant())),
        }
    }

    /// Allocates a zero-filled array and returns it opened for writing.
    pub fn add_shared_array<T: Element>(
        &mut self,
        key: impl Into<Key>,
        shape: &[usize],
    ) -> Result<SharedArrayMut<T>, StoreError> {
        self.ensure_writable()?;
        let key = key.into();
        if shape.len() > MAX_DIMS {
            return Err(StoreError::ShapeMismatch {
                expected: vec![MAX_DIMS],
                found: shape.to_vec(),
            });
        }
        let name = key.entry_name(Variant::Array)?;
        self.replace_slot(&key)?;
        let meta = ArrayMeta {
            path: self.path.join(name),
            dtype: T::DTYPE,
            shape: shape.to_vec(),
        };
        create_array_file(&meta)?;
        self.entries.insert(key, Entry::Array(meta.clone()));
        SharedArrayMut::open(meta)
    }

    /// Stores a copy of `data` as a shared array.
    pub fn put_array<T: Element>(
        &mut self,
        key: impl Into<Key>,
        shape: &[usize],
        data: &[T],
    ) -> Result<(), StoreError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(StoreError::ShapeMismatch {
                expected: shape.to_vec(),
                found: vec![data.len()],
            });
        }
        let mut arr = self.add_shared_array::<T>(key, shape)?;
        arr.as_mut_slice().copy_from_slice(data);
        arr.flush()
    }

    /// Stores a copy of an `ndarray` in logical order.
    pub fn put_ndarray<T, S, D>(
        &mut self,
        key: impl Into<Key>,
        array: &ArrayBase<S, D>,
    ) -> Result<(), StoreError>
    where
        T: Element,
        S: Data<Elem = T>,
        D: Dimension,
    {
        let mut arr = self.add_shared_array::<T>(key, array.shape())?;
        for (dst, src) in arr.as_mut_slice().iter_mut().zip(array.iter()) {
            *dst = *src;
        }
        arr.flush()
    }

    /// Creates an empty child namespace under `key`, replacing whatever the
    /// slot held. This is the only way a namespace entry comes into being;
    /// existing namespaces are never copied or assigned into another slot.
    pub fn add_sub_namespace(&mut self, key: impl Into<Key>) -> Result<Namespace, StoreError> {
        self.ensure_writable()?;
        let key = key.into();
        let name = key.entry_name(Variant::Namespace)?;
        self.replace_slot(&key)?;
        let sub = Namespace::create(self.path.join(name))?;
        self.entries.insert(key, Entry::Namespace(sub.path.clone()));
        Ok(sub)
    }

    pub fn sub_namespace(&self, key: impl Into<Key>) -> Result<Namespace, StoreError> {
        let key = key.into();
        match self.lookup(&key)? {
            Entry::Namespace(path) => Namespace::attach(path, self.read_only),
            other => Err(wrong_kind(&key, Variant::Namespace, other.variant())),
        }
    }

    pub fn array_meta(&self, key: impl Into<Key>) -> Result<&ArrayMeta, StoreError> {
        let key = key.into();
        match self.lookup(&key)? {
            Entry::Array(meta) => Ok(meta),
            other => Err(wrong_kind(&key, Variant::Array, other.variant())),
        }
    }

    fn typed_meta<T: Element>(&self, key: Key) -> Result<ArrayMeta, StoreError> {
        let meta = self.array_meta(key.clone())?;
        if meta.dtype != T::DTYPE {
            return Err(StoreError::DtypeMismatch {
                key: key.to_string(),
                expected: T::DTYPE.name(),
                found: meta.dtype.name(),
            });
        }
        Ok(meta.clone())
    }

    /// Read-only mapping of an array. Any number of readers may coexist.
    pub fn array<T: Element>(&self, key: impl Into<Key>) -> Result<SharedArray<T>, StoreError> {
        let meta = self.typed_meta::<T>(key.into())?;
        SharedArray::open(meta)
    }

    /// Exclusive writable mapping. Fails with `WriterBusy` while another
    /// writer holds the same array.
    pub fn array_mut<T: Element>(
        &self,
        key: impl Into<Key>,
    ) -> Result<SharedArrayMut<T>, StoreError> {
        self.ensure_writable()?;
        let meta = self.typed_meta::<T>(key.into())?;
        SharedArrayMut::open(meta)
    }

    /// Shared writable mapping addressed row by row; callers serialise rows
    /// through a [`crate::gridder::RowLocks`] handle.
    pub fn array_striped<T: Element>(
        &self,
        key: impl Into<Key>,
    ) -> Result<StripedArray<T>, StoreError> {
        self.ensure_writable()?;
        let meta = self.typed_meta::<T>(key.into())?;
        StripedArray::open(meta)
    }

    fn lookup(&self, key: &Key) -> Result<&Entry, StoreError> {
        self.entries.get(key).ok_or_else(|| StoreError::NotFound {
            namespace: self.path.clone(),
            key: key.to_string(),
        })
    }

    /// Removes the namespace and everything below it.
    pub fn delete(self) -> Result<(), StoreError> {
        self.ensure_writable()?;
        if self.path.exists() {
            fs::remove_dir_all(&self.path).map_err(|e| StoreError::io(&self.path, e))?;
        }
        Ok(())
    }
}

fn wrong_kind(key: &Key, expected: Variant, found: Variant) -> StoreError {
    StoreError::WrongKind {
        key: key.to_string(),
        expected: expected.describe(),
        found: found.describe(),
    }
}

fn remove_path(path: &Path) -> Result<(), StoreError> {
    let res = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match res {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

fn create_array_file(meta: &ArrayMeta) -> Result<(), StoreError> {
    let mut header = [0u8; HEADER_LEN];
    header[..8].copy_from_slice(ARRAY_MAGIC);
    header[8..12].copy_from_slice(&meta.dtype.code().to_le_bytes());
    header[12..16].copy_from_slice(&(meta.shape.len() as u32).to_le_bytes());
    for (i, dim) in meta.shape.iter().enumerate() {
        let offset = 16 + 8 * i;
        header[offset..offset + 8].copy_from_slice(&(*dim as u64).to_le_bytes());
    }
    let n_bytes = meta.n_elements() * meta.dtype.size();
    let mut file = File::create(&meta.path).map_err(|e| StoreError::io(&meta.path, e))?;
    file.write_all(&header)
        .map_err(|e| StoreError::io(&meta.path, e))?;
    file.set_len((HEADER_LEN + n_bytes) as u64)
        .map_err(|e| StoreError::io(&meta.path, e))?;
    Ok(())
}

fn read_array_header(path: &Path) -> Result<ArrayMeta, StoreError> {
    let corrupt = |reason: String| StoreError::CorruptEntry {
        path: path.to_path_buf(),
        reason,
    };
    let mut file = File::open(path).map_err(|e| StoreError::io(path, e))?;
    let mut header = [0u8; HEADER_LEN];
    file.read_exact(&mut header)
        .map_err(|_| corrupt("array header is truncated".into()))?;
    if &header[..8] != ARRAY_MAGIC {
        return Err(corrupt("bad array magic".into()));
    }
    let code = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    let dtype = DType::from_code(code).ok_or_else(|| corrupt(format!("unknown dtype code {code}")))?;
    let ndim = u32::from_le_bytes([header[12], header[13], header[14], header[15]]) as usize;
    if ndim > MAX_DIMS {
        return Err(corrupt(format!("{ndim} dimensions exceed {MAX_DIMS}")));
    }
    let mut shape = Vec::with_capacity(ndim);
    for i in 0..ndim {
        let offset = 16 + 8 * i;
        let mut dim = [0u8; 8];
        dim.copy_from_slice(&header[offset..offset + 8]);
        shape.push(u64::from_le_bytes(dim) as usize);
    }
    let meta = ArrayMeta {
        path: path.to_path_buf(),
        dtype,
        shape,
    };
    let expected_len = (HEADER_LEN + meta.n_elements() * dtype.size()) as u64;
    let actual_len = file
        .metadata()
        .map_err(|e| StoreError::io(path, e))?
        .len();
    if actual_len != expected_len {
        return Err(corrupt(format!(
            "file holds {actual_len} bytes, header implies {expected_len}"
        )));
    }
    Ok(meta)
}

#[cfg(target_family = "unix")]
fn lock_exclusive(file: &File, path: &Path) -> Result<(), StoreError> {
    use std::os::fd::AsRawFd;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        Err(StoreError::WriterBusy(path.to_path_buf()))
    } else {
        Err(StoreError::io(path, err))
    }
}

#[cfg(not(target_family = "unix"))]
fn lock_exclusive(_file: &File, _path: &Path) -> Result<(), StoreError> {
    Ok(())
}

fn open_rw(meta: &ArrayMeta) -> Result<(File, MmapMut), StoreError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&meta.path)
        .map_err(|e| StoreError::io(&meta.path, e))?;
    // SAFETY: the mapping is private to this handle; concurrent writers are
    // excluded by flock or serialised by row locks.
    let mmap = unsafe { MmapOptions::new().map_mut(&file) }
        .map_err(|e| StoreError::io(&meta.path, e))?;
    Ok((file, mmap))
}

fn view_shape_error(meta: &ArrayMeta) -> StoreError {
    StoreError::ShapeMismatch {
        expected: meta.shape.clone(),
        found: vec![meta.n_elements()],
    }
}

pub struct SharedArray<T: Element> {
    meta: ArrayMeta,
    mmap: Mmap,
    _marker: PhantomData<T>,
}

impl<T: Element> SharedArray<T> {
    fn open(meta: ArrayMeta) -> Result<Self, StoreError> {
        let file = File::open(&meta.path).map_err(|e| StoreError::io(&meta.path, e))?;
        // SAFETY: read-only mapping of a store file.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| StoreError::io(&meta.path, e))?;
        Ok(SharedArray {
            meta,
            mmap,
            _marker: PhantomData,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.meta.shape
    }

    pub fn as_slice(&self) -> &[T] {
        bytemuck::cast_slice(&self.mmap[HEADER_LEN..])
    }

    pub fn view(&self) -> Result<ArrayViewD<'_, T>, StoreError> {
        ArrayViewD::from_shape(IxDyn(&self.meta.shape), self.as_slice())
            .map_err(|_| view_shape_error(&self.meta))
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.as_slice().to_vec()
    }
}

/// Exclusive writer. The advisory lock is released when the handle drops.
pub struct SharedArrayMut<T: Element> {
    meta: ArrayMeta,
    mmap: MmapMut,
    _file: File,
    _marker: PhantomData<T>,
}

impl<T: Element> SharedArrayMut<T> {
    fn open(meta: ArrayMeta) -> Result<Self, StoreError> {
        let (file, mmap) = open_rw(&meta)?;
        lock_exclusive(&file, &meta.path)?;
        Ok(SharedArrayMut {
            meta,
            mmap,
            _file: file,
            _marker: PhantomData,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.meta.shape
    }

    pub fn as_slice(&self) -> &[T] {
        bytemuck::cast_slice(&self.mmap[HEADER_LEN..])
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        bytemuck::cast_slice_mut(&mut self.mmap[HEADER_LEN..])
    }

    pub fn view_mut(&mut self) -> Result<ArrayViewMutD<'_, T>, StoreError> {
        let shape = self.meta.shape.clone();
        let err = view_shape_error(&self.meta);
        ArrayViewMutD::from_shape(IxDyn(&shape), self.as_mut_slice()).map_err(|_| err)
    }

    pub fn fill(&mut self, value: T) {
        self.as_mut_slice().fill(value);
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.mmap
            .flush()
            .map_err(|e| StoreError::io(&self.meta.path, e))
    }
}

/// Writable mapping shared by several writers. Rows are the unit of
/// exclusion; the outermost axis is the row axis.
pub struct StripedArray<T: Element> {
    meta: ArrayMeta,
    mmap: MmapMut,
    row_len: usize,
    _marker: PhantomData<T>,
}

impl<T: Element> StripedArray<T> {
    fn open(meta: ArrayMeta) -> Result<Self, StoreError> {
        let (_file, mmap) = open_rw(&meta)?;
        let rows = meta.shape.first().copied().unwrap_or(1).max(1);
        let row_len = meta.n_elements() / rows;
        Ok(StripedArray {
            meta,
            mmap,
            row_len,
            _marker: PhantomData,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.meta.shape
    }

    pub fn n_rows(&self) -> usize {
        self.meta.shape.first().copied().unwrap_or(0)
    }

    pub fn row_len(&self) -> usize {
        self.row_len
    }

    /// Mutable access to one row. The caller must hold the row's lock.
    pub fn row_mut(&mut self, row: usize) -> &mut [T] {
        let start = row * self.row_len;
        let all: &mut [T] = bytemuck::cast_slice_mut(&mut self.mmap[HEADER_LEN..]);
        &mut all[start..start + self.row_len]
    }

    pub fn row(&self, row: usize) -> &[T] {
        let start = row * self.row_len;
        let all: &[T] = bytemuck::cast_slice(&self.mmap[HEADER_LEN..]);
        &all[start..start + self.row_len]
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.mmap
            .flush()
            .map_err(|e| StoreError::io(&self.meta.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Info {
        label: String,
        nrow: usize,
        freqs: Vec<f64>,
    }

    #[test]
    fn entry_names_round_trip_through_parser() {
        let cases = [
            (Key::Int(-3), Variant::Array, "int:-3:a"),
            (Key::from("CF:0"), Variant::Namespace, "str:CF:0:d"),
            (Key::Bool(true), Variant::Record, "bool:true:p"),
        ];
        for (key, variant, name) in cases {
            assert_eq!(key.entry_name(variant).unwrap(), name);
            assert_eq!(Key::parse_entry(name), Some((key, variant)));
        }
    }

    #[test]
    fn malformed_entry_names_are_rejected() {
        for name in ["float:1.0:p", "int:x:a", "str::p", "bool:yes:p", "int:1:z", "nocolon"] {
            assert!(Key::parse_entry(name).is_none(), "{name} should not parse");
        }
    }

    #[test]
    fn string_keys_with_slash_are_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let mut ns = Namespace::create(dir.path().join("ns")).unwrap();
        let err = ns.put_record("a/b", &1u32).unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedKey(_)));
    }

    #[test]
    fn nested_structure_survives_reattach() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("DATA");
        {
            let mut ns = Namespace::create(&root).unwrap();
            ns.put_record(
                "info",
                &Info {
                    label: "c0".into(),
                    nrow: 3,
                    freqs: vec![1.0e8, 1.1e8],
                },
            )
            .unwrap();
            ns.put_record(7i64, &true).unwrap();
            let data: Vec<Complex<f32>> =
                (0..6).map(|i| Complex::new(i as f32, -(i as f32))).collect();
            ns.put_array("vis", &[3, 2], &data).unwrap();
            let mut sub = ns.add_sub_namespace("sols").unwrap();
            sub.put_array(0usize, &[2], &[1.5f64, 2.5]).unwrap();
            sub.put_record(false, &"beam".to_string()).unwrap();
        }

        let ns = Namespace::attach(&root, true).unwrap();
        assert_eq!(ns.len(), 4);
        let info: Info = ns.get_record("info").unwrap();
        assert_eq!(info.nrow, 3);
        assert_eq!(info.freqs, vec![1.0e8, 1.1e8]);
        assert!(ns.get_record::<bool>(7i64).unwrap());
        let vis = ns.array::<Complex<f32>>("vis").unwrap();
        assert_eq!(vis.shape(), &[3, 2]);
        assert_eq!(vis.view().unwrap()[[2, 1]], Complex::new(5.0, -5.0));
        let sub = ns.sub_namespace("sols").unwrap();
        assert_eq!(sub.array::<f64>(0usize).unwrap().to_vec(), vec![1.5, 2.5]);
        assert_eq!(sub.get_record::<String>(false).unwrap(), "beam");
    }

    #[test]
    fn reload_skips_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ns");
        let mut ns = Namespace::create(&root).unwrap();
        ns.put_record("ok", &1u8).unwrap();
        fs::write(root.join("garbage.txt"), b"x").unwrap();
        fs::write(root.join("int:4:a"), b"too short").unwrap();
        ns.reload().unwrap();
        assert_eq!(ns.len(), 1);
        assert!(ns.contains("ok"));
    }

    #[test]
    fn dtype_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut ns = Namespace::create(dir.path().join("ns")).unwrap();
        ns.put_array("w", &[2], &[1.0f32, 2.0]).unwrap();
        assert!(matches!(
            ns.array::<f64>("w"),
            Err(StoreError::DtypeMismatch { .. })
        ));
    }

    #[test]
    fn second_writer_is_refused_until_first_drops() {
        let dir = tempfile::tempdir().unwrap();
        let mut ns = Namespace::create(dir.path().join("ns")).unwrap();
        let first = ns.add_shared_array::<f32>("grid", &[4, 4]).unwrap();
        assert!(matches!(
            ns.array_mut::<f32>("grid"),
            Err(StoreError::WriterBusy(_))
        ));
        drop(first);
        let mut second = ns.array_mut::<f32>("grid").unwrap();
        second.fill(2.0);
        assert_eq!(ns.array::<f32>("grid").unwrap().as_slice()[15], 2.0);
    }

    #[test]
    fn read_only_namespace_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ns");
        Namespace::create(&root).unwrap();
        let mut ro = Namespace::attach(&root, true).unwrap();
        assert!(ro.is_read_only());
        assert!(matches!(ro.put_record("x", &1u8), Err(StoreError::ReadOnly(_))));
    }

    #[test]
    fn entry_kinds_are_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let mut ns = Namespace::create(dir.path().join("ns")).unwrap();
        ns.put_record("r", &3u32).unwrap();
        ns.put_array(7i64, &[2], &[1.0f64, 2.0]).unwrap();
        let mut child = ns.add_sub_namespace(true).unwrap();
        child.put_record("inner", &1u8).unwrap();
        assert_eq!(ns.variant_of("r"), Some(Variant::Record));
        assert_eq!(ns.variant_of(7i64), Some(Variant::Array));
        assert_eq!(ns.variant_of(true), Some(Variant::Namespace));
        assert_eq!(ns.variant_of("missing"), None);

        // re-adding a namespace slot starts it empty
        let fresh = ns.add_sub_namespace(true).unwrap();
        assert!(fresh.is_empty());
        assert!(ns.sub_namespace(true).unwrap().is_empty());
    }

    #[test]
    fn create_clears_and_delete_removes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ns");
        let mut ns = Namespace::create(&root).unwrap();
        ns.put_record("x", &1u8).unwrap();
        let ns = Namespace::create(&root).unwrap();
        assert!(ns.is_empty());
        ns.delete().unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn striped_rows_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let mut ns = Namespace::create(dir.path().join("ns")).unwrap();
        ns.put_array("data", &[3, 2], &[0i32; 6]).unwrap();
        let mut a = ns.array_striped::<i32>("data").unwrap();
        let mut b = ns.array_striped::<i32>("data").unwrap();
        assert_eq!((a.n_rows(), a.row_len()), (3, 2));
        a.row_mut(0)[1] = 5;
        b.row_mut(2)[0] = 7;
        a.flush().unwrap();
        b.flush().unwrap();
        assert_eq!(ns.array::<i32>("data").unwrap().to_vec(), vec![0, 5, 0, 0, 7, 0]);
    }
}
