//! Parsing of the `EncryptionInfo` stream (Standard binary header or Agile XML descriptor).

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use quick_xml::events::{BytesStart, Event as XmlEvent};
use quick_xml::Reader as XmlReader;

use crate::crypto::HashAlgorithm;
use crate::OffcryptoError;

pub(crate) const CALG_AES_128: u32 = 0x0000_660E;
pub(crate) const CALG_AES_192: u32 = 0x0000_660F;
pub(crate) const CALG_AES_256: u32 = 0x0000_6610;
pub(crate) const CALG_SHA1: u32 = 0x0000_8004;

const PASSWORD_KEY_ENCRYPTOR_NS: &str =
    "http://schemas.microsoft.com/office/2006/keyEncryptor/password";

/// Upper bound on `spinCount` accepted from the descriptor.
pub const MAX_SPIN_COUNT: u32 = 10_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionVersionInfo {
    pub major: u16,
    pub minor: u16,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardEncryptionHeader {
    pub flags: u32,
    pub size_extra: u32,
    pub alg_id: u32,
    pub alg_id_hash: u32,
    pub key_size_bits: u32,
    pub provider_type: u32,
    pub csp_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardEncryptionVerifier {
    pub salt: Vec<u8>,
    pub encrypted_verifier: [u8; 16],
    pub verifier_hash_size: u32,
    pub encrypted_verifier_hash: Vec<u8>,
}

/// `<keyData>`: parameters of the package encryption itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgileKeyData {
    pub salt: Vec<u8>,
    pub hash_algorithm: HashAlgorithm,
    pub block_size: usize,
    pub key_bits: Option<usize>,
}

/// `<dataIntegrity>`: the encrypted HMAC key and value over the `EncryptedPackage` stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgileDataIntegrity {
    pub encrypted_hmac_key: Vec<u8>,
    pub encrypted_hmac_value: Vec<u8>,
}

/// The password `<keyEncryptor>`'s `<encryptedKey>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgilePasswordKey {
    pub spin_count: u32,
    pub salt: Vec<u8>,
    pub hash_algorithm: HashAlgorithm,
    pub key_bits: usize,
    pub block_size: usize,
    pub encrypted_key_value: Vec<u8>,
    pub encrypted_verifier_hash_input: Vec<u8>,
    pub encrypted_verifier_hash_value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgileEncryptionInfo {
    pub key_data: AgileKeyData,
    pub data_integrity: Option<AgileDataIntegrity>,
    pub password_key: AgilePasswordKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptionInfo {
    Standard {
        version: EncryptionVersionInfo,
        header: StandardEncryptionHeader,
        verifier: StandardEncryptionVerifier,
    },
    Agile {
        version: EncryptionVersionInfo,
        info: AgileEncryptionInfo,
    },
    /// A version this crate recognizes as MS-OFFCRYPTO but does not decrypt (e.g. Extensible).
    Unsupported { version: EncryptionVersionInfo },
}

impl EncryptionInfo {
    pub fn version(&self) -> EncryptionVersionInfo {
        match self {
            EncryptionInfo::Standard { version, .. }
            | EncryptionInfo::Agile { version, .. }
            | EncryptionInfo::Unsupported { version } => *version,
        }
    }
}

pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }

    pub(crate) fn take(&mut self, n: usize, context: &'static str) -> Result<&'a [u8], OffcryptoError> {
        let end = self.pos.saturating_add(n);
        if end > self.bytes.len() {
            return Err(OffcryptoError::Truncated { context });
        }
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn read_u16_le(&mut self, context: &'static str) -> Result<u16, OffcryptoError> {
        let b = self.take(2, context)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn read_u32_le(&mut self, context: &'static str) -> Result<u32, OffcryptoError> {
        let b = self.take(4, context)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Parse an MS-OFFCRYPTO `EncryptionInfo` stream.
///
/// Versions `{2,3,4}.2` are Standard encryption, `4.4` is Agile. Any other version parses to
/// [`EncryptionInfo::Unsupported`] so callers can report the version they saw.
pub fn parse_encryption_info(bytes: &[u8]) -> Result<EncryptionInfo, OffcryptoError> {
    let mut r = Reader::new(bytes);
    let major = r.read_u16_le("EncryptionVersionInfo.major")?;
    let minor = r.read_u16_le("EncryptionVersionInfo.minor")?;
    let flags = r.read_u32_le("EncryptionVersionInfo.flags")?;
    let version = EncryptionVersionInfo { major, minor, flags };

    match (major, minor) {
        (4, 4) => {
            let info = parse_agile_xml(r.remaining())?;
            Ok(EncryptionInfo::Agile { version, info })
        }
        (2..=4, 2) => {
            let (header, verifier) = parse_standard(&mut r)?;
            Ok(EncryptionInfo::Standard {
                version,
                header,
                verifier,
            })
        }
        _ => Ok(EncryptionInfo::Unsupported { version }),
    }
}

fn parse_standard(
    r: &mut Reader<'_>,
) -> Result<(StandardEncryptionHeader, StandardEncryptionVerifier), OffcryptoError> {
    let header_size = r.read_u32_le("EncryptionInfo.headerSize")? as usize;
    let header_bytes = r.take(header_size, "EncryptionHeader")?;
    if header_bytes.len() < 8 * 4 {
        return Err(OffcryptoError::Truncated {
            context: "EncryptionHeader (missing fixed fields)",
        });
    }

    let mut hr = Reader::new(header_bytes);
    let flags = hr.read_u32_le("EncryptionHeader.flags")?;
    let size_extra = hr.read_u32_le("EncryptionHeader.sizeExtra")?;
    let alg_id = hr.read_u32_le("EncryptionHeader.algId")?;
    let alg_id_hash = hr.read_u32_le("EncryptionHeader.algIdHash")?;
    let key_size_bits = hr.read_u32_le("EncryptionHeader.keySize")?;
    let provider_type = hr.read_u32_le("EncryptionHeader.providerType")?;
    hr.take(8, "EncryptionHeader.reserved")?;
    let header = StandardEncryptionHeader {
        flags,
        size_extra,
        alg_id,
        alg_id_hash,
        key_size_bits,
        provider_type,
        csp_name: decode_csp_name_utf16le(hr.remaining()),
    };

    // Only the AES + SHA1 subset is decryptable; RC4 CryptoAPI lands here as an unsupported algId.
    let expected_key_size = match header.alg_id {
        CALG_AES_128 => 128,
        CALG_AES_192 => 192,
        CALG_AES_256 => 256,
        other => return Err(OffcryptoError::UnsupportedAlgorithm(other)),
    };
    if header.key_size_bits != expected_key_size {
        return Err(OffcryptoError::UnsupportedAlgorithm(header.alg_id));
    }
    // algIdHash 0 means "SHA1" for AES CryptoAPI producers.
    if header.alg_id_hash != CALG_SHA1 && header.alg_id_hash != 0 {
        return Err(OffcryptoError::UnsupportedAlgorithm(header.alg_id_hash));
    }

    let salt_size = r.read_u32_le("EncryptionVerifier.saltSize")?;
    if salt_size != 16 {
        return Err(OffcryptoError::InvalidEncryptionInfo {
            context: "EncryptionVerifier.saltSize must be 16",
        });
    }
    let salt = r.take(16, "EncryptionVerifier.salt")?.to_vec();

    let mut encrypted_verifier = [0u8; 16];
    encrypted_verifier.copy_from_slice(r.take(16, "EncryptionVerifier.encryptedVerifier")?);

    let verifier_hash_size = r.read_u32_le("EncryptionVerifier.verifierHashSize")?;
    if verifier_hash_size != 20 {
        return Err(OffcryptoError::InvalidEncryptionInfo {
            context: "EncryptionVerifier.verifierHashSize must be 20",
        });
    }
    // 20-byte SHA1, padded to the AES block size.
    let encrypted_verifier_hash = r
        .take(32, "EncryptionVerifier.encryptedVerifierHash")?
        .to_vec();

    Ok((
        header,
        StandardEncryptionVerifier {
            salt,
            encrypted_verifier,
            verifier_hash_size,
            encrypted_verifier_hash,
        },
    ))
}

/// Lossy decode; the CSP name is informational only.
fn decode_csp_name_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|u| *u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

#[derive(Debug, Clone, Default)]
struct NamespaceFrame {
    decls: Vec<(Vec<u8>, Vec<u8>)>,
}

fn push_namespace_frame(
    stack: &mut Vec<NamespaceFrame>,
    elem: &BytesStart<'_>,
) -> Result<(), OffcryptoError> {
    let mut frame = NamespaceFrame::default();
    for attr in elem.attributes().with_checks(false) {
        let attr = attr.map_err(|_| OffcryptoError::InvalidEncryptionInfo {
            context: "invalid XML attribute",
        })?;
        let key = attr.key.as_ref();
        if key == b"xmlns" {
            frame.decls.push((Vec::new(), attr.value.to_vec()));
        } else if let Some(prefix) = key.strip_prefix(b"xmlns:") {
            frame.decls.push((prefix.to_vec(), attr.value.to_vec()));
        }
    }
    stack.push(frame);
    Ok(())
}

fn resolve_namespace_uri<'a>(stack: &'a [NamespaceFrame], prefix: &[u8]) -> Option<&'a [u8]> {
    stack
        .iter()
        .rev()
        .flat_map(|frame| frame.decls.iter())
        .find(|(p, _)| p.as_slice() == prefix)
        .map(|(_, uri)| uri.as_slice())
}

fn element_prefix(name: &[u8]) -> &[u8] {
    name.iter()
        .rposition(|b| *b == b':')
        .map(|idx| &name[..idx])
        .unwrap_or(&[])
}

fn local_name(name: &[u8]) -> &[u8] {
    name.iter()
        .rposition(|b| *b == b':')
        .map(|idx| &name[idx + 1..])
        .unwrap_or(name)
}

/// Attributes of one element, keyed by local name.
struct Attrs {
    values: Vec<(Vec<u8>, String)>,
}

impl Attrs {
    fn collect(e: &BytesStart<'_>) -> Result<Self, OffcryptoError> {
        let mut values = Vec::new();
        for attr in e.attributes().with_checks(false) {
            let attr = attr.map_err(|_| OffcryptoError::InvalidEncryptionInfo {
                context: "invalid XML attribute",
            })?;
            let value = std::str::from_utf8(attr.value.as_ref()).map_err(|_| {
                OffcryptoError::InvalidEncryptionInfo {
                    context: "invalid UTF-8 attribute value",
                }
            })?;
            values.push((local_name(attr.key.as_ref()).to_vec(), value.to_string()));
        }
        Ok(Self { values })
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k.as_slice() == name.as_bytes())
            .map(|(_, v)| v.as_str())
    }

    fn require(&self, name: &str, context: &'static str) -> Result<&str, OffcryptoError> {
        self.get(name)
            .ok_or(OffcryptoError::InvalidEncryptionInfo { context })
    }

    fn base64(&self, name: &str, context: &'static str) -> Result<Vec<u8>, OffcryptoError> {
        decode_b64_attr(self.require(name, context)?)
    }

    fn decimal<T: std::str::FromStr>(
        &self,
        name: &str,
        context: &'static str,
    ) -> Result<Option<T>, OffcryptoError> {
        self.get(name)
            .map(|v| {
                v.trim()
                    .parse::<T>()
                    .map_err(|_| OffcryptoError::InvalidEncryptionInfo { context })
            })
            .transpose()
    }

    fn hash_algorithm(&self, context: &'static str) -> Result<HashAlgorithm, OffcryptoError> {
        HashAlgorithm::parse_offcrypto_name(self.require("hashAlgorithm", context)?)
    }

    /// Agile documents only use AES in CBC mode; absent attributes mean the defaults.
    fn check_cipher(&self) -> Result<(), OffcryptoError> {
        if let Some(alg) = self.get("cipherAlgorithm") {
            if !alg.trim().eq_ignore_ascii_case("AES") {
                return Err(OffcryptoError::UnsupportedEncryption(format!(
                    "cipherAlgorithm {}",
                    alg.trim()
                )));
            }
        }
        if let Some(chaining) = self.get("cipherChaining") {
            if !chaining.trim().eq_ignore_ascii_case("ChainingModeCBC") {
                return Err(OffcryptoError::UnsupportedEncryption(format!(
                    "cipherChaining {}",
                    chaining.trim()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct AgileBuilder {
    key_data: Option<AgileKeyData>,
    data_integrity: Option<AgileDataIntegrity>,
    password_key: Option<AgilePasswordKey>,
    saw_other_key_encryptor: bool,
}

impl AgileBuilder {
    fn element(&mut self, ns_stack: &[NamespaceFrame], e: &BytesStart<'_>) -> Result<(), OffcryptoError> {
        match e.local_name().as_ref() {
            b"keyData" if self.key_data.is_none() => {
                let attrs = Attrs::collect(e)?;
                attrs.check_cipher()?;
                self.key_data = Some(AgileKeyData {
                    salt: attrs.base64("saltValue", "missing keyData.saltValue")?,
                    hash_algorithm: attrs.hash_algorithm("missing keyData.hashAlgorithm")?,
                    block_size: attrs
                        .decimal("blockSize", "invalid keyData.blockSize")?
                        .ok_or(OffcryptoError::InvalidEncryptionInfo {
                            context: "missing keyData.blockSize",
                        })?,
                    key_bits: attrs.decimal("keyBits", "invalid keyData.keyBits")?,
                });
            }
            b"dataIntegrity" => {
                let attrs = Attrs::collect(e)?;
                self.data_integrity = Some(AgileDataIntegrity {
                    encrypted_hmac_key: attrs
                        .base64("encryptedHmacKey", "missing dataIntegrity.encryptedHmacKey")?,
                    encrypted_hmac_value: attrs.base64(
                        "encryptedHmacValue",
                        "missing dataIntegrity.encryptedHmacValue",
                    )?,
                });
            }
            b"encryptedKey" => {
                let name = e.name();
                let ns_uri = resolve_namespace_uri(ns_stack, element_prefix(name.as_ref()));
                if ns_uri != Some(PASSWORD_KEY_ENCRYPTOR_NS.as_bytes()) {
                    self.saw_other_key_encryptor = true;
                    return Ok(());
                }
                let attrs = Attrs::collect(e)?;
                attrs.check_cipher()?;
                let spin_count = attrs
                    .decimal::<u32>("spinCount", "invalid encryptedKey.spinCount")?
                    .ok_or(OffcryptoError::InvalidEncryptionInfo {
                        context: "missing encryptedKey.spinCount",
                    })?;
                if spin_count > MAX_SPIN_COUNT {
                    return Err(OffcryptoError::InvalidEncryptionInfo {
                        context: "encryptedKey.spinCount exceeds 10000000",
                    });
                }
                self.password_key = Some(AgilePasswordKey {
                    spin_count,
                    salt: attrs.base64("saltValue", "missing encryptedKey.saltValue")?,
                    hash_algorithm: attrs.hash_algorithm("missing encryptedKey.hashAlgorithm")?,
                    key_bits: attrs
                        .decimal("keyBits", "invalid encryptedKey.keyBits")?
                        .ok_or(OffcryptoError::InvalidEncryptionInfo {
                            context: "missing encryptedKey.keyBits",
                        })?,
                    block_size: attrs
                        .decimal("blockSize", "invalid encryptedKey.blockSize")?
                        .unwrap_or(16),
                    encrypted_key_value: attrs.base64(
                        "encryptedKeyValue",
                        "missing encryptedKey.encryptedKeyValue",
                    )?,
                    encrypted_verifier_hash_input: attrs.base64(
                        "encryptedVerifierHashInput",
                        "missing encryptedKey.encryptedVerifierHashInput",
                    )?,
                    encrypted_verifier_hash_value: attrs.base64(
                        "encryptedVerifierHashValue",
                        "missing encryptedKey.encryptedVerifierHashValue",
                    )?,
                });
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(self) -> Result<AgileEncryptionInfo, OffcryptoError> {
        let key_data = self.key_data.ok_or(OffcryptoError::InvalidEncryptionInfo {
            context: "missing <keyData> element",
        })?;
        let password_key = match self.password_key {
            Some(key) => key,
            None if self.saw_other_key_encryptor => {
                return Err(OffcryptoError::UnsupportedEncryption(
                    "agile descriptor has no password key encryptor".to_string(),
                ))
            }
            None => {
                return Err(OffcryptoError::InvalidEncryptionInfo {
                    context: "missing password <encryptedKey> element",
                })
            }
        };
        if key_data.block_size != 16 || password_key.block_size != 16 {
            return Err(OffcryptoError::InvalidEncryptionInfo {
                context: "AES blockSize must be 16",
            });
        }
        if self.data_integrity.is_none() {
            log::warn!("agile EncryptionInfo has no <dataIntegrity>; package HMAC cannot be checked");
        }
        Ok(AgileEncryptionInfo {
            key_data,
            data_integrity: self.data_integrity,
            password_key,
        })
    }
}

fn parse_agile_xml(xml_bytes: &[u8]) -> Result<AgileEncryptionInfo, OffcryptoError> {
    let xml_bytes = xml_bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(xml_bytes);
    let end = xml_bytes
        .iter()
        .rposition(|b| *b != 0)
        .map(|idx| idx + 1)
        .unwrap_or(0);
    let xml = std::str::from_utf8(&xml_bytes[..end]).map_err(|_| {
        OffcryptoError::InvalidEncryptionInfo {
            context: "agile EncryptionInfo XML is not valid UTF-8",
        }
    })?;

    let mut reader = XmlReader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut ns_stack: Vec<NamespaceFrame> = Vec::new();
    let mut builder = AgileBuilder::default();

    loop {
        let event = reader
            .read_event()
            .map_err(|_| OffcryptoError::InvalidEncryptionInfo {
                context: "agile EncryptionInfo XML parse error",
            })?;
        match event {
            XmlEvent::Start(e) => {
                push_namespace_frame(&mut ns_stack, &e)?;
                builder.element(&ns_stack, &e)?;
            }
            XmlEvent::Empty(e) => {
                push_namespace_frame(&mut ns_stack, &e)?;
                builder.element(&ns_stack, &e)?;
                ns_stack.pop();
            }
            XmlEvent::End(_) => {
                ns_stack.pop();
            }
            XmlEvent::Eof => break,
            _ => {}
        }
    }

    builder.finish()
}

/// Decode a base64 attribute, tolerating embedded whitespace and missing `=` padding.
pub(crate) fn decode_b64_attr(value: &str) -> Result<Vec<u8>, OffcryptoError> {
    let cleaned: Vec<u8> = value
        .bytes()
        .filter(|b| !matches!(b, b'\r' | b'\n' | b'\t' | b' '))
        .collect();
    STANDARD
        .decode(&cleaned)
        .or_else(|_| STANDARD_NO_PAD.decode(&cleaned))
        .map_err(|_| OffcryptoError::InvalidEncryptionInfo {
            context: "invalid base64 value",
        })
}
