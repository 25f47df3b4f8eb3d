//! The PDF standard security handler, revisions 2-5.
//!
//! The master key is derived once from the password and the encryption
//! dictionary; strings and stream payloads are decrypted lazily as objects
//! are resolved.

use aes::cipher::block_padding::{NoPadding, Pkcs7};
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::*;
use crate::primitive::{Dictionary, PlainRef, Primitive};

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// 7.6.3.3 - the standard padding string
const PADDING: [u8; 32] = [
    0x28, 0xBF, 0x4E, 0x5E, 0x4E, 0x75, 0x8A, 0x41, 0x64, 0x00, 0x4E, 0x56, 0xFF, 0xFA, 0x01, 0x08,
    0x2E, 0x2E, 0x00, 0xB6, 0xD0, 0x68, 0x3E, 0x80, 0x2F, 0x0C, 0xA9, 0xFE, 0x64, 0x53, 0x69, 0x7A,
];

#[derive(Copy)]
pub struct Rc4 {
    i: u8,
    j: u8,
    state: [u8; 256],
}
impl Clone for Rc4 {
    fn clone(&self) -> Rc4 {
        *self
    }
}
impl Rc4 {
    pub fn new(key: &[u8]) -> Rc4 {
        debug_assert!(!key.is_empty() && key.len() <= 256);
        let mut rc4 = Rc4 { i: 0, j: 0, state: [0; 256] };
        for (i, x) in rc4.state.iter_mut().enumerate() {
            *x = i as u8;
        }
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(rc4.state[i]).wrapping_add(key[i % key.len()]);
            rc4.state.swap(i, j as usize);
        }
        rc4
    }
    fn next(&mut self) -> u8 {
        self.i = self.i.wrapping_add(1);
        self.j = self.j.wrapping_add(self.state[self.i as usize]);
        self.state.swap(self.i as usize, self.j as usize);
        self.state[(self.state[self.i as usize].wrapping_add(self.state[self.j as usize])) as usize]
    }
    pub fn encrypt(key: &[u8], data: &mut [u8]) {
        let mut rc4 = Rc4::new(key);
        for b in data.iter_mut() {
            *b ^= rc4.next();
        }
    }
}

/// 7.6.1 Table 20 + 7.6.3.2 Table 21, read dynamically off the `/Encrypt`
/// dictionary.
#[derive(Debug, Clone)]
pub struct CryptDict {
    pub filter: Vec<u8>,
    pub v: i64,
    pub r: i64,
    pub o: Vec<u8>,
    pub u: Vec<u8>,
    pub oe: Option<Vec<u8>>,
    pub ue: Option<Vec<u8>>,
    pub p: i32,
    pub bits: u32,
    pub stm_method: CryptMethod,
    pub str_method: CryptMethod,
    pub encrypt_metadata: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptMethod {
    None,
    V2,
    AesV2,
    AesV3,
}

impl CryptDict {
    pub fn from_dict(dict: &Dictionary) -> Result<CryptDict> {
        let filter = t!(dict.require("Encrypt", "Filter")).as_name()?.0.clone();
        if filter != b"Standard" {
            err!(PdfError::UnsupportedEncryption {
                msg: format!("security handler /{}", String::from_utf8_lossy(&filter)),
            });
        }
        let v = t!(dict.require("Encrypt", "V")).as_int()?;
        let r = t!(dict.require("Encrypt", "R")).as_int()?;
        let o = t!(dict.require("Encrypt", "O")).as_string()?.data.clone();
        let u = t!(dict.require("Encrypt", "U")).as_string()?.data.clone();
        let p = t!(dict.require("Encrypt", "P")).as_int()? as i32;
        let bits = match dict.get("Length") {
            Some(p) => p.as_u32()?,
            None => 40,
        };
        let oe = dict.get("OE").and_then(|p| p.as_string().ok()).map(|s| s.data.clone());
        let ue = dict.get("UE").and_then(|p| p.as_string().ok()).map(|s| s.data.clone());
        let encrypt_metadata = match dict.get("EncryptMetadata") {
            Some(p) => p.as_bool()?,
            None => true,
        };

        // V4/V5 route through named crypt filters
        let (stm_method, str_method) = match v {
            1 | 2 => (CryptMethod::V2, CryptMethod::V2),
            4 | 5 => {
                let cf = dict.get("CF").and_then(|p| p.as_dictionary().ok());
                let lookup = |key: &str| -> Result<CryptMethod> {
                    let name = match dict.get(key) {
                        Some(p) => p.as_name()?.0.clone(),
                        None => b"Identity".to_vec(),
                    };
                    if name == b"Identity" {
                        return Ok(CryptMethod::None);
                    }
                    let filter = cf
                        .and_then(|cf| {
                            cf.iter()
                                .find(|(k, _)| k.0 == name)
                                .map(|(_, v)| v)
                        })
                        .and_then(|p| p.as_dictionary().ok())
                        .ok_or_else(|| PdfError::UnsupportedEncryption {
                            msg: format!("crypt filter /{} not declared", String::from_utf8_lossy(&name)),
                        })?;
                    match filter.get("CFM").and_then(|p| p.as_name().ok()) {
                        Some(n) if *n == "V2" => Ok(CryptMethod::V2),
                        Some(n) if *n == "AESV2" => Ok(CryptMethod::AesV2),
                        Some(n) if *n == "AESV3" => Ok(CryptMethod::AesV3),
                        Some(n) if *n == "None" => Ok(CryptMethod::None),
                        other => Err(PdfError::UnsupportedEncryption {
                            msg: format!("crypt filter method {:?}", other),
                        }),
                    }
                };
                (lookup("StmF")?, lookup("StrF")?)
            }
            v => {
                err!(PdfError::UnsupportedEncryption { msg: format!("/V {}", v) });
            }
        };

        Ok(CryptDict {
            filter,
            v,
            r,
            o,
            u,
            oe,
            ue,
            p,
            bits,
            stm_method,
            str_method,
            encrypt_metadata,
        })
    }
}

pub struct Decoder {
    key_size: usize,
    key: [u8; 32],
    stm_method: CryptMethod,
    str_method: CryptMethod,
    /// Strings inside the /Encrypt dictionary itself are stored in the clear;
    /// decryption is skipped when resolving it.
    pub encrypt_indirect_object: Option<PlainRef>,
}

impl Decoder {
    fn key(&self) -> &[u8] {
        &self.key[..self.key_size]
    }

    pub fn from_password(dict: &CryptDict, id: &[u8], pass: &[u8]) -> Result<Decoder> {
        match dict.r {
            2 | 3 | 4 => Decoder::from_password_legacy(dict, id, pass),
            5 => Decoder::from_password_r5(dict, pass),
            other => Err(PdfError::UnsupportedEncryption {
                msg: format!("standard security handler revision {}", other),
            }),
        }
    }

    /// 7.6.3.3 Algorithm 2: the legacy MD5/RC4 key schedule.
    fn compute_legacy_key(dict: &CryptDict, id: &[u8], pass: &[u8]) -> [u8; 16] {
        let key_size = (dict.bits as usize / 8).clamp(5, 16);

        // a) + b)
        let mut hash = md5::Context::new();
        if pass.len() < 32 {
            hash.consume(pass);
            hash.consume(&PADDING[..32 - pass.len()]);
        } else {
            hash.consume(&pass[..32]);
        }
        // c)
        hash.consume(&dict.o);
        // d)
        hash.consume(dict.p.to_le_bytes());
        // e)
        hash.consume(id);
        // f)
        if dict.r >= 4 && !dict.encrypt_metadata {
            hash.consume([0xff, 0xff, 0xff, 0xff]);
        }
        // g)
        let mut data = *hash.compute();
        // h) 50 extra rounds over the key-sized prefix
        if dict.r >= 3 {
            for _ in 0..50 {
                data = *md5::compute(&data[..key_size]);
            }
        }
        data
    }

    fn from_password_legacy(dict: &CryptDict, id: &[u8], pass: &[u8]) -> Result<Decoder> {
        let key_size = if dict.r == 2 { 5 } else { (dict.bits as usize / 8).clamp(5, 16) };

        let make = |key16: [u8; 16]| {
            let mut key = [0u8; 32];
            key[..16].copy_from_slice(&key16);
            Decoder {
                key,
                key_size,
                stm_method: dict.stm_method,
                str_method: dict.str_method,
                encrypt_indirect_object: None,
            }
        };

        // user password first
        let decoder = make(Self::compute_legacy_key(dict, id, pass));
        if decoder.check_user_password(dict, id) {
            return Ok(decoder);
        }

        // then try `pass` as the owner password: Algorithm 7 recovers the
        // user password by unwinding the RC4 applications over /O
        let owner_key = Self::compute_owner_key(dict, pass);
        let mut user_pass = dict.o.clone();
        if dict.r == 2 {
            Rc4::encrypt(&owner_key[..key_size], &mut user_pass);
        } else {
            for i in (0..20u8).rev() {
                let mut key = [0u8; 16];
                for (k, &b) in key.iter_mut().zip(&owner_key) {
                    *k = b ^ i;
                }
                Rc4::encrypt(&key[..key_size], &mut user_pass);
            }
        }
        let decoder = make(Self::compute_legacy_key(dict, id, &user_pass));
        if decoder.check_user_password(dict, id) {
            Ok(decoder)
        } else {
            Err(PdfError::Unauthorized)
        }
    }

    /// Algorithm 3 steps a-d: the RC4 key derived from the owner password.
    pub fn compute_owner_key(dict: &CryptDict, owner_pass: &[u8]) -> [u8; 16] {
        let key_size = if dict.r == 2 { 5 } else { (dict.bits as usize / 8).clamp(5, 16) };
        let mut hash = md5::Context::new();
        if owner_pass.len() < 32 {
            hash.consume(owner_pass);
            hash.consume(&PADDING[..32 - owner_pass.len()]);
        } else {
            hash.consume(&owner_pass[..32]);
        }
        let mut data = *hash.compute();
        if dict.r >= 3 {
            for _ in 0..50 {
                data = *md5::compute(&data[..key_size]);
            }
        }
        data
    }

    /// Algorithms 4 and 5: the /U value this decoder's key would produce.
    pub fn compute_u(&self, dict: &CryptDict, id: &[u8]) -> Vec<u8> {
        if dict.r == 2 {
            let mut data = PADDING.to_vec();
            Rc4::encrypt(self.key(), &mut data);
            data
        } else {
            let mut hash = md5::Context::new();
            hash.consume(PADDING);
            hash.consume(id);
            let mut data = *hash.compute();
            Rc4::encrypt(self.key(), &mut data);
            for i in 1u8..=19 {
                let mut key = [0u8; 16];
                for (k, &b) in key.iter_mut().zip(&self.key[..16]) {
                    *k = b ^ i;
                }
                Rc4::encrypt(&key[..self.key_size], &mut data);
            }
            data.to_vec()
        }
    }

    pub fn check_user_password(&self, dict: &CryptDict, id: &[u8]) -> bool {
        let computed = self.compute_u(dict, id);
        if dict.r == 2 {
            computed == dict.u
        } else {
            dict.u.len() >= 16 && computed[..16] == dict.u[..16]
        }
    }

    /// Revision 5 (AESV3): SHA-256 based validation, file key unwrapped from
    /// /UE or /OE with AES-256-CBC, zero IV, no padding.
    fn from_password_r5(dict: &CryptDict, pass: &[u8]) -> Result<Decoder> {
        let pass = if pass.len() > 127 { &pass[..127] } else { pass };
        if dict.u.len() < 48 || dict.o.len() < 48 {
            err!(PdfError::UnsupportedEncryption { msg: "short /U or /O for revision 5".into() });
        }
        let (u_hash, u_vsalt, u_ksalt) = (&dict.u[..32], &dict.u[32..40], &dict.u[40..48]);
        let (o_hash, o_vsalt, o_ksalt) = (&dict.o[..32], &dict.o[32..40], &dict.o[40..48]);

        let sha = |parts: &[&[u8]]| -> [u8; 32] {
            let mut h = Sha256::new();
            for p in parts {
                h.update(p);
            }
            h.finalize().into()
        };

        let unwrap_key = |wrapped: &Option<Vec<u8>>, inter: [u8; 32]| -> Result<[u8; 32]> {
            let wrapped = wrapped.as_ref().ok_or(PdfError::UnsupportedEncryption {
                msg: "missing /UE or /OE".into(),
            })?;
            if wrapped.len() < 32 {
                err!(PdfError::DecryptionFailure);
            }
            let mut buf = [0u8; 32];
            buf.copy_from_slice(&wrapped[..32]);
            let iv = [0u8; 16];
            Aes256CbcDec::new_from_slices(&inter, &iv)
                .map_err(|_| PdfError::DecryptionFailure)?
                .decrypt_padded_mut::<NoPadding>(&mut buf)
                .map_err(|_| PdfError::DecryptionFailure)?;
            Ok(buf)
        };

        let key = if &sha(&[pass, u_vsalt])[..] == u_hash {
            unwrap_key(&dict.ue, sha(&[pass, u_ksalt]))?
        } else if &sha(&[pass, o_vsalt, &dict.u[..48]])[..] == o_hash {
            unwrap_key(&dict.oe, sha(&[pass, o_ksalt, &dict.u[..48]]))?
        } else {
            err!(PdfError::Unauthorized);
        };

        Ok(Decoder {
            key,
            key_size: 32,
            stm_method: dict.stm_method,
            str_method: dict.str_method,
            encrypt_indirect_object: None,
        })
    }

    /// Algorithm 1: per-object key, then RC4 or AES-CBC over the data.
    fn decrypt_with(&self, method: CryptMethod, id: PlainRef, mut data: Vec<u8>) -> Result<Vec<u8>> {
        match method {
            CryptMethod::None => Ok(data),
            CryptMethod::V2 => {
                let key = self.object_key(id, false);
                let n = self.key_size;
                Rc4::encrypt(&key[..(n + 5).min(16)], &mut data);
                Ok(data)
            }
            CryptMethod::AesV2 => {
                let key = self.object_key(id, true);
                let n = self.key_size;
                aes_cbc_decrypt_128(&key[..(n + 5).min(16)], data)
            }
            CryptMethod::AesV3 => aes_cbc_decrypt_256(&self.key, data),
        }
    }

    fn object_key(&self, id: PlainRef, aes: bool) -> [u8; 16] {
        let mut key = [0u8; 16 + 5 + 4];
        let n = self.key_size;
        key[..n].copy_from_slice(self.key());
        key[n..n + 3].copy_from_slice(&(id.id as u64).to_le_bytes()[..3]);
        key[n + 3..n + 5].copy_from_slice(&id.gen.to_le_bytes()[..2]);
        let len = if aes {
            key[n + 5..n + 9].copy_from_slice(b"sAlT");
            n + 9
        } else {
            n + 5
        };
        *md5::compute(&key[..len])
    }

    pub fn decrypt_string(&self, id: PlainRef, data: Vec<u8>) -> Result<Vec<u8>> {
        if self.encrypt_indirect_object == Some(id) {
            return Ok(data);
        }
        self.decrypt_with(self.str_method, id, data)
    }

    pub fn decrypt(&self, id: PlainRef, data: Vec<u8>) -> Result<Vec<u8>> {
        if self.encrypt_indirect_object == Some(id) {
            return Ok(data);
        }
        self.decrypt_with(self.stm_method, id, data)
    }
}

fn aes_cbc_decrypt_128(key: &[u8], mut data: Vec<u8>) -> Result<Vec<u8>> {
    if data.len() < 16 || (data.len() - 16) % 16 != 0 {
        err!(PdfError::DecryptionFailure);
    }
    let (iv, ciphertext) = data.split_at_mut(16);
    let plain = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|_| PdfError::DecryptionFailure)?
        .decrypt_padded_mut::<Pkcs7>(ciphertext)
        .map_err(|_| PdfError::DecryptionFailure)?;
    Ok(plain.to_vec())
}

fn aes_cbc_decrypt_256(key: &[u8; 32], mut data: Vec<u8>) -> Result<Vec<u8>> {
    if data.len() < 16 || (data.len() - 16) % 16 != 0 {
        err!(PdfError::DecryptionFailure);
    }
    let (iv, ciphertext) = data.split_at_mut(16);
    let plain = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|_| PdfError::DecryptionFailure)?
        .decrypt_padded_mut::<Pkcs7>(ciphertext)
        .map_err(|_| PdfError::DecryptionFailure)?;
    Ok(plain.to_vec())
}

/// Reads the `/Encrypt` dictionary (if any) out of the trailer and derives a
/// decoder. `Unauthorized` if the password fails both checks.
pub fn decoder_from_trailer(trailer: &Dictionary, resolve_encrypt: &Primitive, pass: &[u8]) -> Result<Option<Decoder>> {
    let encrypt_ref = match trailer.get("Encrypt") {
        None => return Ok(None),
        Some(Primitive::Reference(r)) => Some(*r),
        Some(_) => None,
    };
    let dict = t!(resolve_encrypt.as_dictionary());
    let crypt = t!(CryptDict::from_dict(dict));

    let id = trailer
        .get("ID")
        .and_then(|p| p.as_array().ok())
        .and_then(|arr| arr.first())
        .and_then(|p| p.as_string().ok())
        .map(|s| s.data.clone())
        .unwrap_or_default();

    let mut decoder = t!(Decoder::from_password(&crypt, &id, pass));
    decoder.encrypt_indirect_object = encrypt_ref;
    Ok(Some(decoder))
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Decoder")
            .field("key_size", &self.key_size)
            .field("stm_method", &self.stm_method)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rc4_known_vectors() {
        let mut data = b"Plaintext".to_vec();
        Rc4::encrypt(b"Key", &mut data);
        assert_eq!(data, [0xBB, 0xF3, 0x16, 0xE8, 0xD9, 0x40, 0xAF, 0x0A, 0xD3]);

        let mut data = b"pedia".to_vec();
        Rc4::encrypt(b"Wiki", &mut data);
        assert_eq!(data, [0x10, 0x21, 0xBF, 0x04, 0x20]);

        // symmetric
        let mut data = [0x10, 0x21, 0xBF, 0x04, 0x20];
        Rc4::encrypt(b"Wiki", &mut data);
        assert_eq!(&data, b"pedia");
    }

    fn make_dict(r: i64, bits: u32, o: Vec<u8>, u: Vec<u8>) -> CryptDict {
        CryptDict {
            filter: b"Standard".to_vec(),
            v: if r == 2 { 1 } else { 2 },
            r,
            o,
            u,
            oe: None,
            ue: None,
            p: -4,
            bits,
            stm_method: CryptMethod::V2,
            str_method: CryptMethod::V2,
            encrypt_metadata: true,
        }
    }

    /// Forward half of Algorithm 3, used to fabricate /O values for tests.
    fn compute_o(dict: &CryptDict, owner_pass: &[u8], user_pass: &[u8]) -> Vec<u8> {
        let key_size = if dict.r == 2 { 5 } else { (dict.bits as usize / 8).clamp(5, 16) };
        let owner_key = Decoder::compute_owner_key(dict, owner_pass);
        let mut data = [0u8; 32];
        if user_pass.len() < 32 {
            data[..user_pass.len()].copy_from_slice(user_pass);
            data[user_pass.len()..].copy_from_slice(&PADDING[..32 - user_pass.len()]);
        } else {
            data.copy_from_slice(&user_pass[..32]);
        }
        let mut data = data.to_vec();
        if dict.r == 2 {
            Rc4::encrypt(&owner_key[..key_size], &mut data);
        } else {
            for i in 0..20u8 {
                let mut key = [0u8; 16];
                for (k, &b) in key.iter_mut().zip(&owner_key) {
                    *k = b ^ i;
                }
                Rc4::encrypt(&key[..key_size], &mut data);
            }
        }
        data
    }

    fn authenticated_roundtrip(r: i64, bits: u32) {
        let id = b"\xde\xad\xbe\xef0123456789abcdef";
        let owner_pass = b"owner-secret";

        let mut dict = make_dict(r, bits, Vec::new(), Vec::new());
        dict.o = compute_o(&dict, owner_pass, b"");
        // derive the user key and fabricate a matching /U
        let key = Decoder::compute_legacy_key(&dict, id, b"");
        let mut probe = Decoder {
            key: [0; 32],
            key_size: if r == 2 { 5 } else { bits as usize / 8 },
            stm_method: CryptMethod::V2,
            str_method: CryptMethod::V2,
            encrypt_indirect_object: None,
        };
        probe.key[..16].copy_from_slice(&key);
        dict.u = probe.compute_u(&dict, id);

        // empty user password authenticates
        let dec = Decoder::from_password(&dict, id, b"").unwrap();
        assert_eq!(dec.key(), probe.key());
        // so does the owner password
        let dec2 = Decoder::from_password(&dict, id, owner_pass).unwrap();
        assert_eq!(dec2.key(), probe.key());
        // and a wrong password does not
        assert!(matches!(
            Decoder::from_password(&dict, id, b"nope"),
            Err(PdfError::Unauthorized)
        ));

        // per-object decryption round-trips through RC4
        let obj = PlainRef { id: 12, gen: 0 };
        let plain = b"0.1 0.8 0.1 rg".to_vec();
        let mut enc = plain.clone();
        let okey = dec.object_key(obj, false);
        let n = dec.key_size;
        Rc4::encrypt(&okey[..(n + 5).min(16)], &mut enc);
        assert_eq!(dec.decrypt(obj, enc).unwrap(), plain);
    }

    #[test]
    fn revision_2_roundtrip() {
        authenticated_roundtrip(2, 40);
    }

    #[test]
    fn revision_3_roundtrip() {
        authenticated_roundtrip(3, 128);
    }

    #[test]
    fn aes_cbc_pkcs7() {
        // AES-128 NIST CBC vector, single block, padded manually with a
        // second block of 0x10s so Pkcs7 strips it.
        use aes::cipher::{BlockEncryptMut, KeyIvInit};
        type Enc = cbc::Encryptor<aes::Aes128>;
        let key = [0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c];
        let iv = [0u8; 16];
        let plain = b"exactly 16 bytes".to_vec();
        let mut padded = plain.clone();
        padded.extend_from_slice(&[16u8; 16]);
        let mut buf = padded.clone();
        let ct = Enc::new_from_slices(&key, &iv)
            .unwrap()
            .encrypt_padded_mut::<NoPadding>(&mut buf, padded.len())
            .unwrap()
            .to_vec();

        let mut wire = iv.to_vec();
        wire.extend_from_slice(&ct);
        assert_eq!(aes_cbc_decrypt_128(&key, wire).unwrap(), plain);
    }
}
