use crate::config::FuzzerSettings;
use crate::input::Input;
use rand::Rng;
use rand::seq::index;
use tracing::trace;

/// 8-bit boundary values.
pub const INTERESTING_8: [u8; 5] = [0, 1, 127, 128, 255];
/// 16-bit boundary values, written in either byte order.
pub const INTERESTING_16: [u16; 5] = [0, 1, 32767, 32768, 65535];
/// 32-bit boundary values, written in either byte order.
pub const INTERESTING_32: [u32; 5] = [0, 1, 2147483647, 2147483648, 4294967295];

/// Tokens that tend to upset parsers of text-based request bodies.
pub const DEFAULT_DICTIONARY: [&[u8]; 18] = [
    b"{{",
    b"}}",
    b"<script>",
    b"</script>",
    b"'",
    b"\"",
    b"\\",
    b"\x00",
    b"\xff",
    b"%s",
    b"%n",
    b"%x",
    b"../../../",
    b"null",
    b"undefined",
    b"-1",
    b"0",
    b"99999999",
];

/// Longest run added or removed by the chunk strategies.
const MAX_CHUNK_LEN: usize = 16;
/// Most bits inverted by a single bit-flip mutation.
const MAX_BIT_FLIPS: usize = 4;

/// A single way of deriving a new payload from an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    BitFlip,
    RandomByte,
    InterestingValue,
    ChunkInsert,
    ChunkDelete,
    SwapBytes,
    /// Prefix of the base input joined to a suffix of another corpus input.
    Splice,
    DictionaryToken,
}

impl Strategy {
    pub const ALL: [Strategy; 8] = [
        Strategy::BitFlip,
        Strategy::RandomByte,
        Strategy::InterestingValue,
        Strategy::ChunkInsert,
        Strategy::ChunkDelete,
        Strategy::SwapBytes,
        Strategy::Splice,
        Strategy::DictionaryToken,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

/// Where an interesting value was written, for callers that want to inspect it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Substitution {
    pub offset: usize,
    pub width: usize,
    pub value: u32,
    pub order: ByteOrder,
}

/// A `Mutator` turns one input into a new one.
///
/// Mutators hold no state that changes between calls, so one instance can be
/// shared by every worker; all randomness comes from the caller's `rng`.
/// Mutation never fails: strategies that cannot apply to the given payload
/// fall back to another one.
///
/// # Type Parameters
/// * `R`: The type of random number generator used for mutation decisions.
pub trait Mutator<R: Rng + ?Sized>: Send + Sync {
    /// Produces a mutated copy of `input`.
    ///
    /// # Arguments
    /// * `input`: The base payload. It is never modified.
    /// * `hint`: Forces a strategy; `None` picks one uniformly at random.
    /// * `splice_partner`: A second corpus input, if the corpus has one.
    /// * `rng`: The random number generator.
    fn mutate(
        &self,
        input: &Input,
        hint: Option<Strategy>,
        splice_partner: Option<&Input>,
        rng: &mut R,
    ) -> Input;
}

/// Byte-level havoc mutations with a size cap.
#[derive(Debug, Clone)]
pub struct HavocMutator {
    max_payload_size: usize,
    dictionary: Vec<Vec<u8>>,
}

impl HavocMutator {
    /// Creates a mutator using the built-in dictionary.
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            max_payload_size,
            dictionary: DEFAULT_DICTIONARY.iter().map(|t| t.to_vec()).collect(),
        }
    }

    /// Creates a mutator with a caller-supplied dictionary; an empty one
    /// disables `Strategy::DictionaryToken`.
    pub fn with_dictionary(max_payload_size: usize, dictionary: Vec<Vec<u8>>) -> Self {
        Self {
            max_payload_size,
            dictionary,
        }
    }

    /// Creates a mutator capped at `settings.max_payload_size`, with the
    /// built-in dictionary unless `settings.use_dictionary` is off.
    pub fn from_settings(settings: &FuzzerSettings) -> Self {
        if settings.use_dictionary {
            Self::new(settings.max_payload_size)
        } else {
            Self::with_dictionary(settings.max_payload_size, Vec::new())
        }
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    pub fn dictionary(&self) -> &[Vec<u8>] {
        &self.dictionary
    }

    fn pick_strategy<R: Rng + ?Sized>(&self, has_partner: bool, rng: &mut R) -> Strategy {
        let available: Vec<Strategy> = Strategy::ALL
            .iter()
            .copied()
            .filter(|s| match s {
                Strategy::Splice => has_partner,
                Strategy::DictionaryToken => !self.dictionary.is_empty(),
                _ => true,
            })
            .collect();
        available[rng.random_range(0..available.len())]
    }

    /// Applies `strategy` in place; returns false when it cannot apply.
    fn apply<R: Rng + ?Sized>(
        &self,
        strategy: Strategy,
        bytes: &mut Vec<u8>,
        splice_partner: Option<&Input>,
        rng: &mut R,
    ) -> bool {
        match strategy {
            Strategy::BitFlip => flip_bits(bytes, rng),
            Strategy::RandomByte => randomize_byte(bytes, rng),
            Strategy::InterestingValue => {
                overwrite_interesting(bytes, self.max_payload_size, rng).is_some()
            }
            Strategy::ChunkInsert => {
                insert_chunk(bytes, rng);
                true
            }
            Strategy::ChunkDelete => delete_chunk(bytes, rng),
            Strategy::SwapBytes => swap_bytes(bytes, rng),
            Strategy::Splice => match splice_partner {
                Some(partner) => splice(bytes, partner.as_bytes(), rng),
                None => false,
            },
            Strategy::DictionaryToken => self.insert_token(bytes, rng),
        }
    }

    fn insert_token<R: Rng + ?Sized>(&self, bytes: &mut Vec<u8>, rng: &mut R) -> bool {
        if self.dictionary.is_empty() {
            return false;
        }
        let token = &self.dictionary[rng.random_range(0..self.dictionary.len())];
        let pos = rng.random_range(0..=bytes.len());
        bytes.splice(pos..pos, token.iter().copied());
        true
    }
}

impl<R: Rng + ?Sized> Mutator<R> for HavocMutator {
    fn mutate(
        &self,
        input: &Input,
        hint: Option<Strategy>,
        splice_partner: Option<&Input>,
        rng: &mut R,
    ) -> Input {
        let strategy = hint.unwrap_or_else(|| self.pick_strategy(splice_partner.is_some(), rng));
        let mut bytes = input.to_vec();

        if !self.apply(strategy, &mut bytes, splice_partner, rng) {
            insert_chunk(&mut bytes, rng);
        }

        if bytes.len() > self.max_payload_size {
            trace!(
                len = bytes.len(),
                max = self.max_payload_size,
                ?strategy,
                "truncating oversized mutation"
            );
            bytes.truncate(self.max_payload_size);
        }
        Input::from(bytes)
    }
}

fn flip_bits<R: Rng + ?Sized>(bytes: &mut [u8], rng: &mut R) -> bool {
    if bytes.is_empty() {
        return false;
    }
    let total_bits = bytes.len() * 8;
    let flips = rng.random_range(1..=MAX_BIT_FLIPS).min(total_bits);
    // Distinct positions, so no flip undoes another.
    for bit in index::sample(rng, total_bits, flips) {
        bytes[bit / 8] ^= 1 << (bit % 8);
    }
    true
}

fn randomize_byte<R: Rng + ?Sized>(bytes: &mut [u8], rng: &mut R) -> bool {
    if bytes.is_empty() {
        return false;
    }
    let pos = rng.random_range(0..bytes.len());
    // XOR with a non-zero value so the byte always changes.
    bytes[pos] ^= rng.random_range(1u8..=255u8);
    true
}

/// Encodes entry `index` of the table for `width` in the given byte order.
pub fn interesting_bytes(width: usize, index: usize, order: ByteOrder) -> (u32, Vec<u8>) {
    match width {
        1 => {
            let v = INTERESTING_8[index % INTERESTING_8.len()];
            (v as u32, vec![v])
        }
        2 => {
            let v = INTERESTING_16[index % INTERESTING_16.len()];
            let bytes = match order {
                ByteOrder::Little => v.to_le_bytes(),
                ByteOrder::Big => v.to_be_bytes(),
            };
            (v as u32, bytes.to_vec())
        }
        _ => {
            let v = INTERESTING_32[index % INTERESTING_32.len()];
            let bytes = match order {
                ByteOrder::Little => v.to_le_bytes(),
                ByteOrder::Big => v.to_be_bytes(),
            };
            (v, bytes.to_vec())
        }
    }
}

/// Writes `value` at `offset`, growing `bytes` when the region runs past
/// the end.
pub fn write_at(bytes: &mut Vec<u8>, offset: usize, value: &[u8]) {
    let end = offset + value.len();
    if bytes.len() < end {
        bytes.resize(end, 0);
    }
    bytes[offset..end].copy_from_slice(value);
}

/// Overwrites 1, 2 or 4 bytes of a non-empty payload with a boundary value.
///
/// The written region always ends at or before `max_len`, so a later
/// truncation to `max_len` never cuts the value. A region that starts inside
/// a payload shorter than its width grows the payload; otherwise the region
/// lies entirely inside the existing bytes. Widths larger than `max_len` are
/// not offered.
pub fn overwrite_interesting<R: Rng + ?Sized>(
    bytes: &mut Vec<u8>,
    max_len: usize,
    rng: &mut R,
) -> Option<Substitution> {
    if bytes.is_empty() {
        return None;
    }
    let widths: Vec<usize> = [1usize, 2, 4]
        .into_iter()
        .filter(|w| *w <= max_len)
        .collect();
    if widths.is_empty() {
        return None;
    }
    let width = widths[rng.random_range(0..widths.len())];
    let order = if rng.random_bool(0.5) {
        ByteOrder::Little
    } else {
        ByteOrder::Big
    };
    let (value, encoded) = interesting_bytes(width, rng.random_range(0..5), order);

    let room = bytes.len().min(max_len);
    let offset = if room >= width {
        rng.random_range(0..=room - width)
    } else {
        // room < width <= max_len, so the payload itself is shorter than width.
        rng.random_range(0..=(bytes.len() - 1).min(max_len - width))
    };
    write_at(bytes, offset, &encoded);
    Some(Substitution {
        offset,
        width,
        value,
        order,
    })
}

fn insert_chunk<R: Rng + ?Sized>(bytes: &mut Vec<u8>, rng: &mut R) {
    let len = rng.random_range(1..=MAX_CHUNK_LEN);
    let chunk: Vec<u8> = if !bytes.is_empty() && rng.random_bool(0.5) {
        let start = rng.random_range(0..bytes.len());
        let end = (start + len).min(bytes.len());
        bytes[start..end].to_vec()
    } else {
        (0..len).map(|_| rng.random::<u8>()).collect()
    };
    let pos = rng.random_range(0..=bytes.len());
    bytes.splice(pos..pos, chunk);
}

fn delete_chunk<R: Rng + ?Sized>(bytes: &mut Vec<u8>, rng: &mut R) -> bool {
    match bytes.len() {
        0 => false,
        1 => true,
        len => {
            let start = rng.random_range(0..len);
            let count = rng.random_range(1..=MAX_CHUNK_LEN.min(len - start));
            bytes.drain(start..start + count);
            true
        }
    }
}

fn swap_bytes<R: Rng + ?Sized>(bytes: &mut [u8], rng: &mut R) -> bool {
    if bytes.len() < 2 {
        return false;
    }
    let a = rng.random_range(0..bytes.len());
    let b = rng.random_range(0..bytes.len());
    bytes.swap(a, b);
    true
}

/// Keeps a prefix of `bytes` and appends a non-empty suffix of `partner`.
fn splice<R: Rng + ?Sized>(bytes: &mut Vec<u8>, partner: &[u8], rng: &mut R) -> bool {
    if partner.is_empty() {
        return false;
    }
    let cut = rng.random_range(0..=bytes.len());
    let partner_cut = rng.random_range(0..partner.len());
    bytes.truncate(cut);
    bytes.extend_from_slice(&partner[partner_cut..]);
    true
}
