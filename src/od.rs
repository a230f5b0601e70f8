//! Object Dictionary: a typed, indexed store of device parameters.
//!
//! Objects are kept in an array sorted by 16-bit index, each holding its
//! entries sorted by 8-bit sub-index, so lookup is two binary searches and a
//! successful lookup can be cached as an [`OdHandle`]. The shape of the
//! dictionary is fixed once [`OdBuilder::build`] returns; only entry values
//! and per-object callbacks change afterwards.
//!
//! Exclusive access follows Rust ownership: `&Od` for lookups, `&mut Od` for
//! value access (callbacks may mutate state), and a held `&mut Od` is the
//! critical section for multi-access sequences.

use core::cmp::Ordering;
use core::ops::RangeInclusive;

use bitfield_struct::bitfield;

use crate::data_type::DataType;
use crate::error::{AbortCode, ErrorCode};
use crate::prelude::*;
use crate::util::bits_to_bytes;

/// Entry access rights (CiA 301, table 43).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadWrite,
    WriteOnly,
    ReadOnly,
    /// Read-only and immutable through the regular write path; only
    /// privileged `set` operations may change it.
    Const,
}

impl Access {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Access::ReadWrite,
            1 => Access::WriteOnly,
            2 => Access::ReadOnly,
            _ => Access::Const,
        }
    }

    const fn raw(self) -> u8 {
        match self {
            Access::ReadWrite => 0,
            Access::WriteOnly => 1,
            Access::ReadOnly => 2,
            Access::Const => 3,
        }
    }

    pub const fn is_readable(self) -> bool {
        !matches!(self, Access::WriteOnly)
    }

    /// Writable by a client (SDO download). `set` bypasses this.
    pub const fn is_writable(self) -> bool {
        matches!(self, Access::ReadWrite | Access::WriteOnly)
    }
}

/// PDO mapping capability (CiA 301, table 53).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdoMapping {
    None,
    Rpdo,
    Tpdo,
    Both,
}

impl PdoMapping {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => PdoMapping::Rpdo,
            2 => PdoMapping::Tpdo,
            3 => PdoMapping::Both,
            _ => PdoMapping::None,
        }
    }

    const fn raw(self) -> u8 {
        match self {
            PdoMapping::None => 0,
            PdoMapping::Rpdo => 1,
            PdoMapping::Tpdo => 2,
            PdoMapping::Both => 3,
        }
    }
}

/// Packed entry attributes: access rights at bits [1:0], PDO mapping at
/// [3:2], node-ID-relative COB-ID flag at bit 4.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct EntryAttr {
    #[bits(2)]
    access_raw: u8,

    #[bits(2)]
    pdo_mapping_raw: u8,

    pub relative: bool,

    #[bits(3)]
    _reserved: u8,
}

impl EntryAttr {
    pub const fn read_write() -> Self {
        Self::new().with_access(Access::ReadWrite)
    }

    pub const fn read_only() -> Self {
        Self::new().with_access(Access::ReadOnly)
    }

    pub const fn write_only() -> Self {
        Self::new().with_access(Access::WriteOnly)
    }

    pub const fn constant() -> Self {
        Self::new().with_access(Access::Const)
    }

    pub const fn access(&self) -> Access {
        Access::from_raw(self.access_raw())
    }

    pub const fn with_access(self, access: Access) -> Self {
        self.with_access_raw(access.raw())
    }

    pub const fn pdo_mapping(&self) -> PdoMapping {
        PdoMapping::from_raw(self.pdo_mapping_raw())
    }

    pub const fn with_pdo_mapping(self, mapping: PdoMapping) -> Self {
        self.with_pdo_mapping_raw(mapping.raw())
    }
}

/// Opaque handle for one `(object, entry)` pair.
///
/// Encodes the entry array index at bits [7:0], the object array index at
/// [23:8] and validity flags at bits 30/31. A valid handle stays valid for
/// the lifetime of the dictionary since the table shape is immutable.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct OdHandle {
    entry_idx: u8,

    #[bits(16)]
    object_idx: u16,

    #[bits(6)]
    _reserved: u8,

    entry_valid: bool,
    object_valid: bool,
}

impl OdHandle {
    /// Both validity bits set: the handle resolves to an existing entry.
    pub const fn is_valid(&self) -> bool {
        self.object_valid() && self.entry_valid()
    }
}

/// Scalar values storable in a dictionary entry, with their CiA 301 type
/// code and little-endian encoding.
pub trait Scalar {
    const DATA_TYPE: DataType;

    fn to_le_vec(&self) -> Vec<u8>;
}

macro_rules! impl_scalar {
    ($t:ty, $dt:expr) => {
        impl Scalar for $t {
            const DATA_TYPE: DataType = $dt;

            fn to_le_vec(&self) -> Vec<u8> {
                self.to_le_bytes().to_vec()
            }
        }
    };
}

impl_scalar!(u8, DataType::Unsigned8);
impl_scalar!(u16, DataType::Unsigned16);
impl_scalar!(u32, DataType::Unsigned32);
impl_scalar!(u64, DataType::Unsigned64);
impl_scalar!(i8, DataType::Integer8);
impl_scalar!(i16, DataType::Integer16);
impl_scalar!(i32, DataType::Integer32);
impl_scalar!(i64, DataType::Integer64);
impl_scalar!(f32, DataType::Real32);
impl_scalar!(f64, DataType::Real64);

/// A single object dictionary entry: type and attribute metadata plus its
/// backing storage and the power-on default used by the NMT reset services.
pub struct OdEntry {
    subindex: u8,
    data_type: DataType,
    bits: u8,
    attr: EntryAttr,
    size: usize,
    data: Vec<u8>,
    default: Vec<u8>,
    min: Option<Vec<u8>>,
    max: Option<Vec<u8>>,
}

impl OdEntry {
    pub fn scalar<T: Scalar>(subindex: u8, value: T, attr: EntryAttr) -> Self {
        let data = value.to_le_vec();
        OdEntry {
            subindex,
            data_type: T::DATA_TYPE,
            bits: T::DATA_TYPE.bits(),
            attr,
            size: T::DATA_TYPE.storage_size(),
            default: data.clone(),
            data,
            min: None,
            max: None,
        }
    }

    pub fn boolean(subindex: u8, value: bool, attr: EntryAttr) -> Self {
        let mut entry = OdEntry::scalar(subindex, value as u8, attr);
        entry.data_type = DataType::Boolean;
        entry.bits = 1;
        entry
    }

    pub fn unsigned8(subindex: u8, value: u8, attr: EntryAttr) -> Self {
        OdEntry::scalar(subindex, value, attr)
    }

    pub fn unsigned16(subindex: u8, value: u16, attr: EntryAttr) -> Self {
        OdEntry::scalar(subindex, value, attr)
    }

    pub fn unsigned32(subindex: u8, value: u32, attr: EntryAttr) -> Self {
        OdEntry::scalar(subindex, value, attr)
    }

    pub fn unsigned64(subindex: u8, value: u64, attr: EntryAttr) -> Self {
        OdEntry::scalar(subindex, value, attr)
    }

    pub fn integer16(subindex: u8, value: i16, attr: EntryAttr) -> Self {
        OdEntry::scalar(subindex, value, attr)
    }

    pub fn integer32(subindex: u8, value: i32, attr: EntryAttr) -> Self {
        OdEntry::scalar(subindex, value, attr)
    }

    /// String of up to `capacity` bytes; the stored length tracks the
    /// current content.
    pub fn visible_string(subindex: u8, value: &str, capacity: usize, attr: EntryAttr) -> Self {
        let mut entry = OdEntry::octet_string(subindex, value.as_bytes(), capacity, attr);
        entry.data_type = DataType::VisibleString;
        entry
    }

    pub fn octet_string(subindex: u8, value: &[u8], capacity: usize, attr: EntryAttr) -> Self {
        let data = value[..value.len().min(capacity)].to_vec();
        OdEntry {
            subindex,
            data_type: DataType::OctetString,
            bits: 8,
            attr,
            size: capacity,
            default: data.clone(),
            data,
            min: None,
            max: None,
        }
    }

    /// Large variable-length data; `capacity` bounds client downloads.
    pub fn domain(subindex: u8, capacity: usize, attr: EntryAttr) -> Self {
        OdEntry {
            subindex,
            data_type: DataType::Domain,
            bits: 0,
            attr,
            size: capacity,
            default: Vec::new(),
            data: Vec::new(),
            min: None,
            max: None,
        }
    }

    /// Lower bound for client writes. The value must be of the entry's type.
    pub fn with_min<T: Scalar>(mut self, min: T) -> Self {
        self.min = Some(min.to_le_vec());
        self
    }

    /// Upper bound for client writes. The value must be of the entry's type.
    pub fn with_max<T: Scalar>(mut self, max: T) -> Self {
        self.max = Some(max.to_le_vec());
        self
    }

    pub fn subindex(&self) -> u8 {
        self.subindex
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn attr(&self) -> EntryAttr {
        self.attr
    }

    /// Capacity in bytes of the backing storage.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current value bytes (little-endian; content length for strings).
    pub fn value(&self) -> &[u8] {
        &self.data
    }

    /// Bytes a client transfer of this entry carries: the declared bit width
    /// rounded up for scalars, the current content length otherwise.
    fn wire_len(&self) -> usize {
        if self.data_type.is_variable_length() {
            self.data.len()
        } else {
            bits_to_bytes(self.bits)
        }
    }

    fn restore_default(&mut self) {
        self.data = self.default.clone();
    }
}

/// Per-object access callback.
///
/// Invoked with the object index, the entry and the access being performed.
/// For writes the callback runs before the commit; returning an abort code
/// suppresses the commit and surfaces the code to the caller (and onto the
/// bus as an SDO abort). For reads the value buffer arrives pre-filled from
/// the backing storage and the callback may overwrite it.
pub type OdCallback = Box<dyn FnMut(u16, &OdEntry, OdAccess<'_>) -> Result<(), AbortCode>>;

/// The access being performed when an [`OdCallback`] runs.
pub enum OdAccess<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

/// An object: a 16-bit index and its entries, sorted by sub-index.
pub struct OdObject {
    index: u16,
    entries: Vec<OdEntry>,
    callback: Option<OdCallback>,
}

impl OdObject {
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn entries(&self) -> &[OdEntry] {
        &self.entries
    }
}

/// The object dictionary. Built once with [`OdBuilder`]; shape is immutable
/// afterwards.
pub struct Od {
    objects: Vec<OdObject>,
}

impl Od {
    pub fn builder() -> OdBuilder {
        OdBuilder::new()
    }

    pub fn objects(&self) -> &[OdObject] {
        &self.objects
    }

    /// Locate an entry. Never fails: if only the object exists the returned
    /// handle carries just the object validity bit, and a missing object
    /// yields the zero handle. Inspect with [`OdHandle::is_valid`].
    pub fn find(&self, index: u16, subindex: u8) -> OdHandle {
        match self.objects.binary_search_by_key(&index, |obj| obj.index) {
            Ok(obj_idx) => {
                let handle = OdHandle::new()
                    .with_object_valid(true)
                    .with_object_idx(obj_idx as u16);
                self.find_by_handle(handle, subindex)
            }
            Err(_) => OdHandle::new(),
        }
    }

    /// Re-resolve another sub-index under the object of an existing handle.
    pub fn find_by_handle(&self, handle: OdHandle, subindex: u8) -> OdHandle {
        let handle = handle.with_entry_valid(false).with_entry_idx(0);

        let Some(obj) = self.object(handle) else {
            return handle;
        };

        match obj.entries.binary_search_by_key(&subindex, |e| e.subindex) {
            Ok(entry_idx) => handle
                .with_entry_valid(true)
                .with_entry_idx(entry_idx as u8),
            Err(_) => handle,
        }
    }

    fn object(&self, handle: OdHandle) -> Option<&OdObject> {
        if !handle.object_valid() {
            return None;
        }

        self.objects.get(handle.object_idx() as usize)
    }

    fn entry(&self, handle: OdHandle) -> Option<&OdEntry> {
        if !handle.is_valid() {
            return None;
        }

        self.object(handle)?.entries.get(handle.entry_idx() as usize)
    }

    /// Recover the 16-bit object index from a handle.
    pub fn handle_index(&self, handle: OdHandle) -> Result<u16, ErrorCode> {
        self.object(handle)
            .map(|obj| obj.index)
            .ok_or(ErrorCode::InvalidHandle)
    }

    /// Recover the 8-bit sub-index from a handle.
    pub fn handle_subindex(&self, handle: OdHandle) -> Result<u8, ErrorCode> {
        self.entry(handle)
            .map(|entry| entry.subindex)
            .ok_or(ErrorCode::InvalidHandle)
    }

    pub fn get_type(&self, handle: OdHandle) -> Result<DataType, ErrorCode> {
        self.entry(handle)
            .map(|entry| entry.data_type)
            .ok_or(ErrorCode::InvalidHandle)
    }

    pub fn get_bits(&self, handle: OdHandle) -> Result<u8, ErrorCode> {
        self.entry(handle)
            .map(|entry| entry.bits)
            .ok_or(ErrorCode::InvalidHandle)
    }

    pub fn get_size(&self, handle: OdHandle) -> Result<usize, ErrorCode> {
        self.entry(handle)
            .map(|entry| entry.size)
            .ok_or(ErrorCode::InvalidHandle)
    }

    pub fn get_attr(&self, handle: OdHandle) -> Result<EntryAttr, ErrorCode> {
        self.entry(handle)
            .map(|entry| entry.attr)
            .ok_or(ErrorCode::InvalidHandle)
    }

    /// Install the access callback for the object at `index`. May be called
    /// at any time; replaces any previous callback.
    pub fn set_callback(&mut self, index: u16, callback: OdCallback) -> Result<(), ErrorCode> {
        match self.objects.binary_search_by_key(&index, |obj| obj.index) {
            Ok(obj_idx) => {
                self.objects[obj_idx].callback = Some(callback);
                Ok(())
            }
            Err(_) => Err(ErrorCode::ObjectNotFound { index }),
        }
    }

    /// Visit every entry in (index ascending, sub-index ascending) order.
    /// The visitor short-circuits the iteration by returning `Err`.
    pub fn foreach_entry<E>(
        &self,
        mut f: impl FnMut(OdHandle) -> Result<(), E>,
    ) -> Result<(), E> {
        for (obj_idx, obj) in self.objects.iter().enumerate() {
            for entry_idx in 0..obj.entries.len() {
                let handle = OdHandle::new()
                    .with_object_valid(true)
                    .with_object_idx(obj_idx as u16)
                    .with_entry_valid(true)
                    .with_entry_idx(entry_idx as u8);

                f(handle)?;
            }
        }

        Ok(())
    }

    /// Visit every entry whose COB-ID is flagged node-ID-relative.
    pub fn foreach_relative(&self, mut f: impl FnMut(u16, &OdEntry)) {
        for obj in &self.objects {
            for entry in &obj.entries {
                if entry.attr.relative() {
                    f(obj.index, entry);
                }
            }
        }
    }

    /// Read an entry into `buf`, enforcing access rights. Returns the number
    /// of bytes read.
    pub fn read(
        &mut self,
        index: u16,
        subindex: u8,
        buf: &mut [u8],
    ) -> Result<usize, ErrorCode> {
        let handle = self.find(index, subindex);
        self.read_by_handle(handle, buf)
    }

    pub fn read_by_handle(
        &mut self,
        handle: OdHandle,
        buf: &mut [u8],
    ) -> Result<usize, ErrorCode> {
        let (obj_idx, entry_idx) = self.resolve(handle)?;

        let entry = &self.objects[obj_idx].entries[entry_idx];
        if !entry.attr.access().is_readable() {
            return Err(AbortCode::WriteOnly.into());
        }

        let len = entry.wire_len();
        if buf.len() < len {
            return Err(AbortCode::LengthTooLow.into());
        }

        buf[..len].copy_from_slice(&entry.data[..len]);

        let index = self.objects[obj_idx].index;
        self.run_callback(obj_idx, entry_idx, index, OdAccess::Read(&mut buf[..len]))?;

        Ok(len)
    }

    /// Write an entry, enforcing access rights, length and value bounds.
    pub fn write(
        &mut self,
        index: u16,
        subindex: u8,
        value: &[u8],
    ) -> Result<(), ErrorCode> {
        let handle = self.find(index, subindex);
        self.write_by_handle(handle, value)
    }

    pub fn write_by_handle(
        &mut self,
        handle: OdHandle,
        value: &[u8],
    ) -> Result<(), ErrorCode> {
        self.store(handle, value, false)
    }

    /// Privileged write: bypasses the access attribute and value bounds.
    /// Used for internal updates such as restoring power-on defaults.
    pub fn set(&mut self, index: u16, subindex: u8, value: &[u8]) -> Result<(), ErrorCode> {
        let handle = self.find(index, subindex);
        self.set_by_handle(handle, value)
    }

    pub fn set_by_handle(
        &mut self,
        handle: OdHandle,
        value: &[u8],
    ) -> Result<(), ErrorCode> {
        self.store(handle, value, true)
    }

    pub fn read_u8(&mut self, index: u16, subindex: u8) -> Result<u8, ErrorCode> {
        let mut buf = [0u8; 1];
        self.read_typed(index, subindex, DataType::Unsigned8, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self, index: u16, subindex: u8) -> Result<u16, ErrorCode> {
        let mut buf = [0u8; 2];
        self.read_typed(index, subindex, DataType::Unsigned16, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&mut self, index: u16, subindex: u8) -> Result<u32, ErrorCode> {
        let mut buf = [0u8; 4];
        self.read_typed(index, subindex, DataType::Unsigned32, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u32(
        &mut self,
        index: u16,
        subindex: u8,
        value: u32,
    ) -> Result<(), ErrorCode> {
        let handle = self.find(index, subindex);
        self.check_type(handle, DataType::Unsigned32)?;
        self.write_by_handle(handle, &value.to_le_bytes())
    }

    pub fn set_u32(&mut self, index: u16, subindex: u8, value: u32) -> Result<(), ErrorCode> {
        let handle = self.find(index, subindex);
        self.check_type(handle, DataType::Unsigned32)?;
        self.set_by_handle(handle, &value.to_le_bytes())
    }

    pub fn set_u8(&mut self, index: u16, subindex: u8, value: u8) -> Result<(), ErrorCode> {
        let handle = self.find(index, subindex);
        self.check_type(handle, DataType::Unsigned8)?;
        self.set_by_handle(handle, &[value])
    }

    /// Restore power-on defaults for every object whose index falls within
    /// `range` (NMT reset application / reset communication entry actions).
    pub fn reset_range(&mut self, range: RangeInclusive<u16>) {
        for obj in &mut self.objects {
            if range.contains(&obj.index) {
                for entry in &mut obj.entries {
                    entry.restore_default();
                }
            }
        }
    }

    fn read_typed(
        &mut self,
        index: u16,
        subindex: u8,
        expected: DataType,
        buf: &mut [u8],
    ) -> Result<(), ErrorCode> {
        let handle = self.find(index, subindex);
        self.check_type(handle, expected)?;
        self.read_by_handle(handle, buf)?;
        Ok(())
    }

    fn check_type(&self, handle: OdHandle, expected: DataType) -> Result<(), ErrorCode> {
        if let Some(entry) = self.entry(handle) {
            if entry.data_type != expected {
                return Err(AbortCode::LengthMismatch.into());
            }
        }

        Ok(())
    }

    fn resolve(&self, handle: OdHandle) -> Result<(usize, usize), ErrorCode> {
        if self.object(handle).is_none() {
            return Err(AbortCode::ObjectDoesNotExist.into());
        }

        if self.entry(handle).is_none() {
            return Err(AbortCode::SubindexDoesNotExist.into());
        }

        Ok((handle.object_idx() as usize, handle.entry_idx() as usize))
    }

    fn run_callback(
        &mut self,
        obj_idx: usize,
        entry_idx: usize,
        index: u16,
        access: OdAccess<'_>,
    ) -> Result<(), ErrorCode> {
        // Taken out for the duration of the call so the callback can borrow
        // the object's entry.
        let mut callback = self.objects[obj_idx].callback.take();

        let result = match callback.as_mut() {
            Some(cb) => cb(index, &self.objects[obj_idx].entries[entry_idx], access),
            None => Ok(()),
        };

        self.objects[obj_idx].callback = callback;

        result.map_err(ErrorCode::Abort)
    }

    fn store(
        &mut self,
        handle: OdHandle,
        value: &[u8],
        privileged: bool,
    ) -> Result<(), ErrorCode> {
        let (obj_idx, entry_idx) = self.resolve(handle)?;

        let entry = &self.objects[obj_idx].entries[entry_idx];

        if !privileged && !entry.attr.access().is_writable() {
            return Err(AbortCode::ReadOnly.into());
        }

        if entry.data_type.is_variable_length() {
            if value.len() > entry.size {
                return Err(AbortCode::LengthTooHigh.into());
            }
        } else {
            let expected = bits_to_bytes(entry.bits);
            match value.len().cmp(&expected) {
                Ordering::Less => return Err(AbortCode::LengthTooLow.into()),
                Ordering::Greater => return Err(AbortCode::LengthTooHigh.into()),
                Ordering::Equal => {}
            }
        }

        if !privileged {
            if let Some(min) = &entry.min {
                if scalar_cmp(entry.data_type, value, min) == Ordering::Less {
                    return Err(AbortCode::ParameterValueTooLow.into());
                }
            }

            if let Some(max) = &entry.max {
                if scalar_cmp(entry.data_type, value, max) == Ordering::Greater {
                    return Err(AbortCode::ParameterValueTooHigh.into());
                }
            }
        }

        let index = self.objects[obj_idx].index;
        self.run_callback(obj_idx, entry_idx, index, OdAccess::Write(value))?;

        let entry = &mut self.objects[obj_idx].entries[entry_idx];
        if entry.data_type.is_variable_length() {
            entry.data.clear();
            entry.data.extend_from_slice(value);
        } else {
            entry.data[..value.len()].copy_from_slice(value);
            for byte in entry.data[value.len()..].iter_mut() {
                *byte = 0;
            }
        }

        Ok(())
    }
}

/// Numeric comparison of two stored values of the same entry. Interprets the
/// bytes as little-endian integers, sign-extended for the signed types.
fn scalar_cmp(data_type: DataType, a: &[u8], b: &[u8]) -> Ordering {
    if data_type.is_signed() {
        sign_extend_le(a).cmp(&sign_extend_le(b))
    } else {
        zero_extend_le(a).cmp(&zero_extend_le(b))
    }
}

fn zero_extend_le(bytes: &[u8]) -> u64 {
    let mut value = 0u64;

    for (i, byte) in bytes.iter().enumerate().take(8) {
        value |= (*byte as u64) << (8 * i);
    }

    value
}

fn sign_extend_le(bytes: &[u8]) -> i64 {
    let len = bytes.len().min(8);
    let mut value = zero_extend_le(bytes);

    if len < 8 && len > 0 && bytes[len - 1] & 0x80 != 0 {
        value |= u64::MAX << (8 * len);
    }

    value as i64
}

/// Builds an [`Od`], validating the dictionary invariants: unique sorted
/// object indices, unique sorted sub-indices, a sub-index 0 UNSIGNED8 entry
/// on every multi-entry object, and entry bit widths consistent with their
/// storage sizes.
pub struct OdBuilder {
    objects: Vec<OdObject>,
}

impl OdBuilder {
    pub fn new() -> Self {
        OdBuilder {
            objects: Vec::new(),
        }
    }

    /// Add an object with the given entries (any order; sorted on build).
    pub fn object(mut self, index: u16, entries: Vec<OdEntry>) -> Self {
        self.objects.push(OdObject {
            index,
            entries,
            callback: None,
        });
        self
    }

    /// Add a single-entry VAR object at sub-index 0.
    pub fn variable(self, index: u16, entry: OdEntry) -> Self {
        self.object(index, vec![entry])
    }

    pub fn build(mut self) -> Result<Od, ErrorCode> {
        self.objects.sort_by_key(|obj| obj.index);

        for pair in self.objects.windows(2) {
            if pair[0].index == pair[1].index {
                return Err(ErrorCode::DuplicateObject {
                    index: pair[1].index,
                });
            }
        }

        for obj in &mut self.objects {
            obj.entries.sort_by_key(|entry| entry.subindex);

            for pair in obj.entries.windows(2) {
                if pair[0].subindex == pair[1].subindex {
                    return Err(ErrorCode::DuplicateEntry {
                        index: obj.index,
                        subindex: pair[1].subindex,
                    });
                }
            }

            let has_nonzero = obj.entries.iter().any(|entry| entry.subindex != 0);
            if has_nonzero {
                let sub0_ok = obj
                    .entries
                    .first()
                    .map(|entry| {
                        entry.subindex == 0 && entry.data_type == DataType::Unsigned8
                    })
                    .unwrap_or(false);

                if !sub0_ok {
                    return Err(ErrorCode::MissingSubindexZero { index: obj.index });
                }
            }

            for entry in &obj.entries {
                if !entry.data_type.is_variable_length()
                    && bits_to_bytes(entry.bits) > entry.size
                {
                    return Err(ErrorCode::InvalidEntry {
                        index: obj.index,
                        subindex: entry.subindex,
                    });
                }
            }
        }

        Ok(Od {
            objects: self.objects,
        })
    }
}

impl Default for OdBuilder {
    fn default() -> Self {
        OdBuilder::new()
    }
}
