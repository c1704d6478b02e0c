//! Minimal ledger transaction blob decoder.
//!
//! Submissions carry the signed transaction as a hex blob in the canonical
//! binary field format. Policy only needs a handful of top-level fields
//! (type, account, destination, destination tag, fee), so this walks the
//! field stream and extracts those, skipping everything else by its type's
//! length rules. Anything the walker cannot skip safely is a decode error;
//! the filter treats that as an undecodable submission and falls back to
//! generic command handling.

use thiserror::Error;

/// Field type codes used by the canonical binary format.
const TYPE_UINT16: u8 = 1;
const TYPE_UINT32: u8 = 2;
const TYPE_UINT64: u8 = 3;
const TYPE_HASH128: u8 = 4;
const TYPE_HASH256: u8 = 5;
const TYPE_AMOUNT: u8 = 6;
const TYPE_BLOB: u8 = 7;
const TYPE_ACCOUNT: u8 = 8;
const TYPE_OBJECT: u8 = 14;
const TYPE_ARRAY: u8 = 15;
const TYPE_UINT8: u8 = 16;
const TYPE_HASH160: u8 = 17;
const TYPE_PATHSET: u8 = 18;
const TYPE_VECTOR256: u8 = 19;

/// Errors while decoding a transaction blob.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("transaction blob is not hex")]
    NotHex,

    #[error("transaction blob truncated")]
    Truncated,

    #[error("unsupported field type {0}")]
    UnsupportedType(u8),

    #[error("invalid variable-length prefix {0}")]
    BadVariableLength(u8),
}

/// The policy-relevant subset of a decoded transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedTx {
    pub tx_type_code: Option<u16>,
    pub account: Option<String>,
    pub destination: Option<String>,
    pub destination_tag: Option<u32>,
    pub fee_drops: Option<u64>,
}

impl DecodedTx {
    /// Canonical name of the transaction type, when it is a known code.
    #[must_use]
    pub fn tx_type(&self) -> Option<&'static str> {
        self.tx_type_code.and_then(tx_type_name)
    }

    /// Serializable summary attached to audit events.
    #[must_use]
    pub fn to_audit_json(&self) -> serde_json::Value {
        serde_json::json!({
            "TransactionType": self.tx_type().map(str::to_string)
                .or_else(|| self.tx_type_code.map(|c| format!("Unknown({c})"))),
            "Account": self.account,
            "Destination": self.destination,
            "DestinationTag": self.destination_tag,
            "Fee": self.fee_drops.map(|f| f.to_string()),
        })
    }
}

/// Maps a transaction type code to its canonical name.
#[must_use]
pub fn tx_type_name(code: u16) -> Option<&'static str> {
    Some(match code {
        0 => "Payment",
        1 => "EscrowCreate",
        2 => "EscrowFinish",
        3 => "AccountSet",
        4 => "EscrowCancel",
        5 => "SetRegularKey",
        7 => "OfferCreate",
        8 => "OfferCancel",
        10 => "TicketCreate",
        12 => "SignerListSet",
        13 => "PaymentChannelCreate",
        14 => "PaymentChannelFund",
        15 => "PaymentChannelClaim",
        16 => "CheckCreate",
        17 => "CheckCash",
        18 => "CheckCancel",
        19 => "DepositPreauth",
        20 => "TrustSet",
        21 => "AccountDelete",
        _ => return None,
    })
}

/// Renders a 20-byte account id in its classic base58-check address form.
#[must_use]
pub fn encode_account_id(account_id: &[u8; 20]) -> String {
    bs58::encode(account_id)
        .with_alphabet(bs58::Alphabet::RIPPLE)
        .with_check_version(0x00)
        .into_string()
}

/// Decodes the policy-relevant fields from an uppercase-or-lowercase hex blob.
///
/// # Errors
///
/// Returns [`DecodeError`] when the blob is not hex, is truncated mid-field,
/// or contains a field type the walker cannot measure.
pub fn decode_tx_blob(tx_blob_hex: &str) -> Result<DecodedTx, DecodeError> {
    let bytes = hex::decode(tx_blob_hex).map_err(|_| DecodeError::NotHex)?;
    let mut cursor = Cursor { bytes: &bytes, pos: 0 };
    let mut decoded = DecodedTx::default();

    while !cursor.done() {
        let (type_code, field_code) = cursor.field_header()?;
        match type_code {
            TYPE_UINT16 => {
                let value = cursor.u16()?;
                if field_code == 2 {
                    decoded.tx_type_code = Some(value);
                }
            }
            TYPE_UINT32 => {
                let value = cursor.u32()?;
                if field_code == 14 {
                    decoded.destination_tag = Some(value);
                }
            }
            TYPE_UINT8 => {
                cursor.skip(1)?;
            }
            TYPE_UINT64 => {
                cursor.skip(8)?;
            }
            TYPE_HASH128 => {
                cursor.skip(16)?;
            }
            TYPE_HASH160 => {
                cursor.skip(20)?;
            }
            TYPE_HASH256 => {
                cursor.skip(32)?;
            }
            TYPE_AMOUNT => {
                let drops = cursor.amount()?;
                if field_code == 8 {
                    decoded.fee_drops = drops;
                }
            }
            TYPE_BLOB | TYPE_VECTOR256 => {
                let length = cursor.variable_length()?;
                cursor.skip(length)?;
            }
            TYPE_ACCOUNT => {
                let length = cursor.variable_length()?;
                let raw = cursor.take(length)?;
                if length == 20 {
                    let mut account_id = [0u8; 20];
                    account_id.copy_from_slice(raw);
                    let address = encode_account_id(&account_id);
                    match field_code {
                        1 => decoded.account = Some(address),
                        3 => decoded.destination = Some(address),
                        _ => {}
                    }
                }
            }
            TYPE_OBJECT => cursor.skip_nested(TYPE_OBJECT)?,
            TYPE_ARRAY => cursor.skip_nested(TYPE_ARRAY)?,
            TYPE_PATHSET => cursor.skip_pathset()?,
            other => return Err(DecodeError::UnsupportedType(other)),
        }
    }

    Ok(decoded)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn done(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn byte(&mut self) -> Result<u8, DecodeError> {
        let byte = *self.bytes.get(self.pos).ok_or(DecodeError::Truncated)?;
        self.pos += 1;
        Ok(byte)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn take(&mut self, length: usize) -> Result<&[u8], DecodeError> {
        let end = self.pos.checked_add(length).ok_or(DecodeError::Truncated)?;
        let slice = self.bytes.get(self.pos..end).ok_or(DecodeError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, length: usize) -> Result<(), DecodeError> {
        self.take(length).map(|_| ())
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let raw = self.take(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Reads a field header: high nibble type / low nibble field, with the
    /// out-of-line byte forms for codes of 16 and above.
    fn field_header(&mut self) -> Result<(u8, u8), DecodeError> {
        let first = self.byte()?;
        let mut type_code = first >> 4;
        let mut field_code = first & 0x0F;
        if type_code == 0 {
            type_code = self.byte()?;
        }
        if field_code == 0 {
            field_code = self.byte()?;
        }
        Ok((type_code, field_code))
    }

    /// Variable-length prefix per the canonical encoding's three ranges.
    fn variable_length(&mut self) -> Result<usize, DecodeError> {
        let first = self.byte()?;
        match first {
            0..=192 => Ok(first as usize),
            193..=240 => {
                let second = self.byte()?;
                Ok(193 + ((first as usize) - 193) * 256 + second as usize)
            }
            241..=254 => {
                let second = self.byte()?;
                let third = self.byte()?;
                Ok(12481 +
                    ((first as usize) - 241) * 65536 +
                    (second as usize) * 256 +
                    third as usize)
            }
            _ => Err(DecodeError::BadVariableLength(first)),
        }
    }

    /// Amount field: 8 bytes native, 48 bytes issued. Returns the drop count
    /// for native amounts, `None` for issued currency.
    fn amount(&mut self) -> Result<Option<u64>, DecodeError> {
        let head = *self.bytes.get(self.pos).ok_or(DecodeError::Truncated)?;
        if head & 0x80 == 0 {
            let raw = self.take(8)?;
            let mut value: u64 = 0;
            for byte in raw {
                value = (value << 8) | u64::from(*byte);
            }
            Ok(Some(value & 0x3FFF_FFFF_FFFF_FFFF))
        } else {
            self.skip(48)?;
            Ok(None)
        }
    }

    /// Skips a nested object or array up to and including its end marker.
    fn skip_nested(&mut self, container_type: u8) -> Result<(), DecodeError> {
        loop {
            let (type_code, field_code) = self.field_header()?;
            if type_code == container_type && field_code == 1 {
                return Ok(());
            }
            match type_code {
                TYPE_UINT8 => self.skip(1)?,
                TYPE_UINT16 => self.skip(2)?,
                TYPE_UINT32 => self.skip(4)?,
                TYPE_UINT64 => self.skip(8)?,
                TYPE_HASH128 => self.skip(16)?,
                TYPE_HASH160 => self.skip(20)?,
                TYPE_HASH256 => self.skip(32)?,
                TYPE_AMOUNT => {
                    self.amount()?;
                }
                TYPE_BLOB | TYPE_ACCOUNT | TYPE_VECTOR256 => {
                    let length = self.variable_length()?;
                    self.skip(length)?;
                }
                TYPE_OBJECT => self.skip_nested(TYPE_OBJECT)?,
                TYPE_ARRAY => self.skip_nested(TYPE_ARRAY)?,
                TYPE_PATHSET => self.skip_pathset()?,
                other => return Err(DecodeError::UnsupportedType(other)),
            }
        }
    }

    /// Skips a path set: steps of flagged 20-byte segments, paths separated
    /// by `0xFF`, the whole set terminated by `0x00`.
    fn skip_pathset(&mut self) -> Result<(), DecodeError> {
        loop {
            let step = self.byte()?;
            match step {
                0x00 => return Ok(()),
                0xFF => {}
                flags => {
                    if flags & 0x01 != 0 {
                        self.skip(20)?;
                    }
                    if flags & 0x10 != 0 {
                        self.skip(20)?;
                    }
                    if flags & 0x20 != 0 {
                        self.skip(20)?;
                    }
                    if flags & !0x31 != 0 {
                        return Err(DecodeError::UnsupportedType(flags));
                    }
                }
            }
            if self.peek().is_none() {
                return Err(DecodeError::Truncated);
            }
        }
    }
}
