use bytes::{Buf, BufMut, Bytes, BytesMut};
use indexmap::IndexMap;

use crate::{
    error::{Error, Result},
    metadata::TopicPartition,
};

/// Generation reported by members that carry no generation at all: version 0
/// user data, members without user data, and members whose user data could
/// not be decoded.
pub const DEFAULT_GENERATION: i32 = -1;

/// Recovers a member's prior assignment and join generation from the opaque
/// user data it sent along with its subscription.
pub trait UserDataDecoder {
    fn decode(&self, version: i16, user_data: &[u8]) -> Result<(Vec<TopicPartition>, i32)>;
}

/// Decoder for the user data written by sticky assignors, see
/// [`StickyMemberMetadata`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StickyUserData;

impl UserDataDecoder for StickyUserData {
    fn decode(&self, version: i16, user_data: &[u8]) -> Result<(Vec<TopicPartition>, i32)> {
        if user_data.is_empty() {
            return Ok((Vec::new(), DEFAULT_GENERATION));
        }
        let metadata = StickyMemberMetadata::decode(version, user_data)?;
        Ok((metadata.partitions(), metadata.generation))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicAssignment {
    pub topic: String,
    pub partitions: Vec<i32>,
}

/// Sticky assignor member user data.
///
/// Version 0 only carries the member's current assignment. Version 1 appends
/// the generation the assignment was received in, so that a member rejoining
/// with stale data can be told apart from the current owner.
///
/// ```text
/// StickyMemberMetadata => [current_assignment] generation(v1+)
///   current_assignment => topic:string [partitions:int32]
///   generation => int32
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StickyMemberMetadata {
    pub current_assignment: Vec<TopicAssignment>,
    pub generation: i32,
}

impl Default for StickyMemberMetadata {
    fn default() -> Self {
        Self {
            current_assignment: Vec::new(),
            generation: DEFAULT_GENERATION,
        }
    }
}

impl StickyMemberMetadata {
    pub const MIN_VERSION: i16 = 0;
    pub const MAX_VERSION: i16 = 1;

    /// Groups `partitions` by topic, keeping topics in first-seen order.
    pub fn new<I: IntoIterator<Item = TopicPartition>>(partitions: I, generation: i32) -> Self {
        let mut topics: IndexMap<String, Vec<i32>> = IndexMap::new();
        for TopicPartition { topic, partition } in partitions {
            topics.entry(topic).or_default().push(partition);
        }
        Self {
            current_assignment: topics
                .into_iter()
                .map(|(topic, partitions)| TopicAssignment { topic, partitions })
                .collect(),
            generation,
        }
    }

    pub fn partitions(&self) -> Vec<TopicPartition> {
        self.current_assignment
            .iter()
            .flat_map(|assignment| {
                assignment
                    .partitions
                    .iter()
                    .map(|partition| TopicPartition::new(assignment.topic.clone(), *partition))
            })
            .collect()
    }

    fn check_version(version: i16) -> Result<i16> {
        if (Self::MIN_VERSION..=Self::MAX_VERSION).contains(&version) {
            Ok(version)
        } else {
            Err(Error::InvalidVersion(version))
        }
    }

    pub fn decode(version: i16, mut buf: &[u8]) -> Result<Self> {
        let version = Self::check_version(version)?;

        let num_topics = read_len(&mut buf)?;
        // every topic takes at least a string length and an array length
        let mut current_assignment = Vec::with_capacity(num_topics.min(buf.remaining() / 6));
        for _ in 0..num_topics {
            let topic = read_string(&mut buf)?;
            let num_partitions = read_len(&mut buf)?;
            ensure(&buf, num_partitions.saturating_mul(4))?;
            let mut partitions = Vec::with_capacity(num_partitions);
            for _ in 0..num_partitions {
                partitions.push(buf.get_i32());
            }
            current_assignment.push(TopicAssignment { topic, partitions });
        }

        let generation = if version >= 1 {
            ensure(&buf, 4)?;
            buf.get_i32()
        } else {
            DEFAULT_GENERATION
        };

        if buf.has_remaining() {
            return Err(Error::TrailingBytes(buf.remaining()));
        }

        Ok(Self {
            current_assignment,
            generation,
        })
    }

    pub fn encode(&self, version: i16) -> Result<Bytes> {
        let version = Self::check_version(version)?;

        let mut bytes = BytesMut::new();
        bytes.put_i32(array_len(self.current_assignment.len())?);
        for assignment in &self.current_assignment {
            let topic = assignment.topic.as_bytes();
            let len = i16::try_from(topic.len())
                .map_err(|_| Error::TopicNameTooLong(topic.len()))?;
            bytes.put_i16(len);
            bytes.put_slice(topic);
            bytes.put_i32(array_len(assignment.partitions.len())?);
            for partition in &assignment.partitions {
                bytes.put_i32(*partition);
            }
        }
        if version >= 1 {
            bytes.put_i32(self.generation);
        }
        Ok(bytes.freeze())
    }
}

fn ensure(buf: &[u8], needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        Err(Error::Truncated {
            needed,
            remaining: buf.remaining(),
        })
    } else {
        Ok(())
    }
}

fn array_len(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| Error::ArrayTooLong(len))
}

fn read_len(buf: &mut &[u8]) -> Result<usize> {
    ensure(buf, 4)?;
    let len = buf.get_i32();
    usize::try_from(len).map_err(|_| Error::NegativeLength(len))
}

fn read_string(buf: &mut &[u8]) -> Result<String> {
    ensure(buf, 2)?;
    let len = buf.get_i16();
    let len = usize::try_from(len).map_err(|_| Error::NegativeLength(len as i32))?;
    ensure(buf, len)?;
    let topic = buf[..len].to_vec();
    buf.advance(len);
    Ok(String::from_utf8(topic)?)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn v1_bytes() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1i32.to_be_bytes());
        bytes.extend_from_slice(&2i16.to_be_bytes());
        bytes.extend_from_slice(b"t0");
        bytes.extend_from_slice(&2i32.to_be_bytes());
        bytes.extend_from_slice(&3i32.to_be_bytes());
        bytes.extend_from_slice(&1i32.to_be_bytes());
        bytes.extend_from_slice(&7i32.to_be_bytes());
        bytes
    }

    #[test]
    fn decode_v1() -> Result<()> {
        let metadata = StickyMemberMetadata::decode(1, &v1_bytes())?;
        assert_eq!(7, metadata.generation);
        assert_eq!(
            vec![TopicPartition::new("t0", 3), TopicPartition::new("t0", 1)],
            metadata.partitions()
        );
        Ok(())
    }

    #[test]
    fn decode_v0_has_default_generation() -> Result<()> {
        let mut bytes = v1_bytes();
        bytes.truncate(bytes.len() - 4);

        let metadata = StickyMemberMetadata::decode(0, &bytes)?;
        assert_eq!(DEFAULT_GENERATION, metadata.generation);
        assert_eq!(2, metadata.partitions().len());
        Ok(())
    }

    #[test]
    fn encode_matches_wire_layout() -> Result<()> {
        let metadata = StickyMemberMetadata::new(
            [TopicPartition::new("t0", 3), TopicPartition::new("t0", 1)],
            7,
        );
        assert_eq!(v1_bytes(), metadata.encode(1)?.to_vec());
        assert_eq!(v1_bytes().len() - 4, metadata.encode(0)?.len());
        Ok(())
    }

    #[test]
    fn new_groups_topics_in_first_seen_order() {
        let metadata = StickyMemberMetadata::new(
            [
                TopicPartition::new("b", 0),
                TopicPartition::new("a", 1),
                TopicPartition::new("b", 2),
            ],
            3,
        );
        assert_eq!(
            vec![
                TopicAssignment {
                    topic: "b".into(),
                    partitions: vec![0, 2],
                },
                TopicAssignment {
                    topic: "a".into(),
                    partitions: vec![1],
                },
            ],
            metadata.current_assignment
        );
    }

    #[test]
    fn rejects_malformed_user_data() {
        let bytes = v1_bytes();

        assert!(matches!(
            StickyMemberMetadata::decode(1, &bytes[..bytes.len() - 1]),
            Err(Error::Truncated { .. })
        ));
        assert!(matches!(
            StickyMemberMetadata::decode(0, &bytes),
            Err(Error::TrailingBytes(4))
        ));
        assert!(matches!(
            StickyMemberMetadata::decode(2, &bytes),
            Err(Error::InvalidVersion(2))
        ));
        assert!(matches!(
            StickyMemberMetadata::decode(1, &(-1i32).to_be_bytes()),
            Err(Error::NegativeLength(-1))
        ));

        let mut bad_topic = 1i32.to_be_bytes().to_vec();
        bad_topic.extend_from_slice(&1i16.to_be_bytes());
        bad_topic.push(0xff);
        bad_topic.extend_from_slice(&0i32.to_be_bytes());
        assert!(matches!(
            StickyMemberMetadata::decode(0, &bad_topic),
            Err(Error::InvalidTopicName(_))
        ));
    }

    #[test]
    fn array_lengths_must_fit_in_an_int32() -> Result<()> {
        assert_eq!(i32::MAX, array_len(i32::MAX as usize)?);
        assert!(matches!(
            array_len(i32::MAX as usize + 1),
            Err(Error::ArrayTooLong(len)) if len == i32::MAX as usize + 1
        ));
        Ok(())
    }

    #[test]
    fn huge_partition_count_does_not_allocate() {
        let mut bytes = 1i32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&1i16.to_be_bytes());
        bytes.push(b't');
        bytes.extend_from_slice(&i32::MAX.to_be_bytes());

        assert!(matches!(
            StickyMemberMetadata::decode(1, &bytes),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn empty_user_data_is_no_history() -> Result<()> {
        let (partitions, generation) = StickyUserData.decode(1, &[])?;
        assert!(partitions.is_empty());
        assert_eq!(DEFAULT_GENERATION, generation);
        Ok(())
    }
}
