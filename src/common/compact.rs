//! Compact node info encoding, as used in the `nodes` and `nodes6` fields of Krpc responses.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

use crate::common::{Contact, Id, ID_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// IP version of the addresses in a compact contact list.
pub enum AddressFamily {
    /// 4 bytes addresses, the `nodes` field.
    V4,
    /// 16 bytes addresses, the `nodes6` field.
    V6,
}

impl AddressFamily {
    fn address_len(&self) -> usize {
        match self {
            AddressFamily::V4 => 4,
            AddressFamily::V6 => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Encoder and decoder of compact contact lists.
///
/// Each record is the contact's id, followed by its IP address and a big endian port.
pub struct ContactCodec {
    id_length: usize,
    family: AddressFamily,
}

impl ContactCodec {
    pub fn new(id_length: usize, family: AddressFamily) -> Self {
        Self { id_length, family }
    }

    /// Size in bytes of one encoded contact.
    pub fn record_len(&self) -> usize {
        self.id_length + self.family.address_len() + 2
    }

    pub fn id_length(&self) -> usize {
        self.id_length
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Encode every contact with a well formed id and an address of this codec's family.
    ///
    /// Other contacts are skipped, the output is exactly `record_len` times the
    /// number of encoded contacts.
    pub fn encode<'a, I>(&self, contacts: I) -> Bytes
    where
        I: IntoIterator<Item = &'a Contact>,
    {
        let mut buf = BytesMut::new();

        for contact in contacts {
            if contact.id().len() != self.id_length {
                continue;
            }

            match (self.family, contact.address().ip()) {
                (AddressFamily::V4, IpAddr::V4(ip)) => {
                    buf.reserve(self.record_len());
                    buf.put_slice(contact.id().as_bytes());
                    buf.put_slice(&ip.octets());
                }
                (AddressFamily::V6, IpAddr::V6(ip)) => {
                    buf.reserve(self.record_len());
                    buf.put_slice(contact.id().as_bytes());
                    buf.put_slice(&ip.octets());
                }
                _ => continue,
            }

            buf.put_u16(contact.address().port());
        }

        buf.freeze()
    }

    /// Decode as many whole records as `bytes` holds.
    ///
    /// Records with port `0` are dropped, and a trailing partial record is ignored,
    /// so this never fails.
    pub fn decode(&self, bytes: &[u8]) -> Vec<Contact> {
        let record_len = self.record_len();
        let address_len = self.family.address_len();

        bytes
            .chunks_exact(record_len)
            .filter_map(|record| {
                let (id, rest) = record.split_at(self.id_length);
                let (ip, port) = rest.split_at(address_len);

                let port = u16::from_be_bytes([port[0], port[1]]);
                if port == 0 {
                    return None;
                }

                let ip = match self.family {
                    AddressFamily::V4 => {
                        IpAddr::V4(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]))
                    }
                    AddressFamily::V6 => {
                        let mut octets = [0_u8; 16];
                        octets.copy_from_slice(ip);
                        IpAddr::V6(Ipv6Addr::from(octets))
                    }
                };

                let id = Id::from_bytes(id, self.id_length).ok()?;

                Some(Contact::new(id, SocketAddr::new(ip, port)))
            })
            .collect()
    }
}

impl Default for ContactCodec {
    fn default() -> Self {
        Self::new(ID_SIZE, AddressFamily::V4)
    }
}
